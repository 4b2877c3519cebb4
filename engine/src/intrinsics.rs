/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Rules built into every scheduler: store operations and process execution.
//!
//! `Snapshot` is only computed from a `Digest`, so `Get(Snapshot, PathGlobs)` resolves through
//! `path_globs_to_digest` without being ambiguous.

use knot_store::{
    AddPrefix, CreateDigest, Digest, DigestContents, DigestEntries, DigestSubset, MergeDigests,
    PathGlobs, Paths, RemovePrefix,
};

use crate::{
    context::Context,
    failure::Failure,
    process::{FallibleProcessResult, Process},
    rule::Rule,
};

pub fn intrinsics() -> Vec<Rule> {
    vec![
        Rule::new("create_digest_to_digest", |ctx: Context, (request,): (CreateDigest,)| async move {
            Ok::<_, Failure>(ctx.store().create_digest(&request)?)
        }),
        Rule::new("merge_digests_request_to_digest", |ctx: Context, (request,): (MergeDigests,)| async move {
            Ok::<_, Failure>(ctx.store().merge(&request)?)
        }),
        Rule::new("add_prefix_request_to_digest", |ctx: Context, (request,): (AddPrefix,)| async move {
            Ok::<_, Failure>(ctx.store().add_prefix(&request)?)
        }),
        Rule::new("remove_prefix_request_to_digest", |ctx: Context, (request,): (RemovePrefix,)| async move {
            Ok::<_, Failure>(ctx.store().remove_prefix(&request)?)
        }),
        Rule::new("digest_subset_to_digest", |ctx: Context, (request,): (DigestSubset,)| async move {
            Ok::<_, Failure>(ctx.store().subset(&request)?)
        }),
        Rule::new("path_globs_to_digest", |ctx: Context, (globs,): (PathGlobs,)| async move {
            let store = ctx.store().clone();
            let root = ctx.workspace().build_root().to_owned();
            let snapshot =
                tokio::task::spawn_blocking(move || store.capture(&root, &globs)).await??;
            Ok::<_, Failure>(snapshot.digest)
        }),
        Rule::new("path_globs_to_paths", |ctx: Context, (globs,): (PathGlobs,)| async move {
            let root = ctx.workspace().build_root().to_owned();
            let paths = tokio::task::spawn_blocking(move || {
                globs.parse().and_then(|globs| globs.expand_paths(&root))
            })
            .await??;
            Ok::<Paths, Failure>(paths)
        }),
        Rule::new("digest_to_snapshot", |ctx: Context, (digest,): (Digest,)| async move {
            Ok::<_, Failure>(ctx.store().snapshot(digest)?)
        }),
        Rule::new("directory_digest_to_digest_contents", |ctx: Context, (digest,): (Digest,)| async move {
            Ok::<DigestContents, Failure>(ctx.store().contents(digest)?)
        }),
        Rule::new("get_digest_entries", |ctx: Context, (digest,): (Digest,)| async move {
            Ok::<DigestEntries, Failure>(ctx.store().entries(digest)?)
        }),
        Rule::new("process_request_to_fallible_result", |ctx: Context, (process,): (Process,)| async move {
            let result = ctx.execute_process(process).await?;
            result.downcast::<FallibleProcessResult>().ok_or_else(|| {
                Failure::throw("process execution did not produce a FallibleProcessResult")
            })
        }),
        Rule::new("fallible_to_exec_result", |ctx: Context, (process,): (Process,)| async move {
            let description = process.description.clone();
            let result: FallibleProcessResult = ctx.get(process).await?;
            result.check(&description)
        })
        .get::<FallibleProcessResult, Process>(),
    ]
    .into_iter()
    .map(Rule::intrinsic)
    .collect()
}
