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

use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use knot_engine::{Context, ExecutionConfig, Failure, Goal, Request, Rule, Scheduler, Tasks};
use knot_rules::{
    Address, Field, FieldSet, InvalidFieldException, Params, Target, Targets, TypeId, Value,
};
use knot_store::{
    CreateDigest, Digest, DigestEntries, DigestEntry, FileContent, PathGlobs, Paths, Snapshot,
    Store,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Name(String);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Punctuation(char);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Greeting(String);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Shout(String);

#[derive(Clone, Default)]
struct Counter(Arc<AtomicUsize>);

impl Counter {
    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

fn config() -> ExecutionConfig {
    ExecutionConfig {
        invalidation_delay: Duration::from_millis(1),
        ..ExecutionConfig::default()
    }
}

fn params(values: Vec<Value>) -> Params {
    Params::new(values)
}

fn greeting_tasks(greets: &Counter) -> Tasks {
    let greets = greets.clone();
    let mut tasks = Tasks::new();
    tasks
        .rule(Rule::new("greet", move |_ctx: Context, (name,): (Name,)| {
            greets.bump();
            async move { Ok::<_, Failure>(Greeting(format!("hello {}", name.0))) }
        }))
        .rule(Rule::new(
            "shout",
            |_ctx: Context, (greeting, punctuation): (Greeting, Punctuation)| async move {
                Ok::<_, Failure>(Shout(format!("{}{}", greeting.0.to_uppercase(), punctuation.0)))
            },
        ))
        .query::<Shout, (Name, Punctuation)>()
        .query::<Greeting, (Name,)>();
    tasks
}

#[tokio::test]
async fn products_are_computed_through_rule_chains() {
    let greets = Counter::default();
    let scheduler = Scheduler::new(greeting_tasks(&greets), Store::new(), config()).unwrap();
    let session = scheduler.session();
    let shout: Shout = session
        .product_request(params(vec![
            Value::new(Name("knot".to_owned())),
            Value::new(Punctuation('!')),
        ]))
        .await
        .unwrap();
    assert_eq!(shout, Shout("HELLO KNOT!".to_owned()));
}

#[tokio::test]
async fn unused_params_do_not_cause_recomputation() {
    let greets = Counter::default();
    let scheduler = Scheduler::new(greeting_tasks(&greets), Store::new(), config()).unwrap();
    let session = scheduler.session();
    let requests = vec!['!', '?', '.']
        .into_iter()
        .map(|p| {
            Request::new::<Shout>(params(vec![
                Value::new(Name("knot".to_owned())),
                Value::new(Punctuation(p)),
            ]))
        })
        .collect();
    let results = session.execute(requests).await;
    let shouts: Vec<Shout> = results
        .into_iter()
        .map(|r| r.unwrap().downcast::<Shout>().unwrap())
        .collect();
    assert_eq!(
        shouts,
        vec![
            Shout("HELLO KNOT!".to_owned()),
            Shout("HELLO KNOT?".to_owned()),
            Shout("HELLO KNOT.".to_owned()),
        ]
    );
    assert_eq!(greets.get(), 1);

    // Memoized across sessions too.
    let greeting: Greeting = scheduler
        .session()
        .product_request(params(vec![Value::new(Name("knot".to_owned()))]))
        .await
        .unwrap();
    assert_eq!(greeting.0, "hello knot");
    assert_eq!(greets.get(), 1);
}

#[tokio::test]
async fn unknown_queries_fail() {
    let scheduler = Scheduler::new(greeting_tasks(&Counter::default()), Store::new(), config())
        .unwrap();
    let err = scheduler
        .session()
        .product_request::<Shout>(params(vec![Value::new(Name("knot".to_owned()))]))
        .await
        .unwrap_err();
    assert_eq!(err.message(), "No installed query computes Shout for (Name)");
}

#[tokio::test]
async fn ambiguous_rules_fail_to_compile() {
    let mut tasks = greeting_tasks(&Counter::default());
    tasks.rule(Rule::new("greet_formally", |_ctx: Context, (name,): (Name,)| async move {
        Ok::<_, Failure>(Greeting(format!("good day {}", name.0)))
    }));
    match Scheduler::new(tasks, Store::new(), config()) {
        Err(err) => assert!(err.to_string().starts_with("Ambiguous rules to compute Greeting")),
        Ok(_) => panic!("expected an ambiguity"),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Words(Vec<String>);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Word(String);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Length(usize);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Lengths(Vec<usize>);

#[tokio::test]
async fn multi_get_preserves_input_order() {
    let mut tasks = Tasks::new();
    tasks
        .rule(Rule::new("length", |_ctx: Context, (word,): (Word,)| async move {
            // Longer words finish first.
            tokio::time::sleep(Duration::from_millis(20 - word.0.len() as u64)).await;
            Ok::<_, Failure>(Length(word.0.len()))
        }))
        .rule(
            Rule::new("lengths", |ctx: Context, (words,): (Words,)| async move {
                let words: Vec<Word> = words.0.into_iter().map(Word).collect();
                let lengths: Vec<Length> = ctx.multi_get(words).await?;
                Ok::<_, Failure>(Lengths(lengths.into_iter().map(|l| l.0).collect()))
            })
            .get::<Length, Word>(),
        )
        .query::<Lengths, (Words,)>();
    let scheduler = Scheduler::new(tasks, Store::new(), config()).unwrap();
    let words = Words(vec!["a".into(), "abcdef".into(), "abc".into()]);
    let lengths: Lengths = scheduler
        .session()
        .product_request(params(vec![Value::new(words)]))
        .await
        .unwrap();
    assert_eq!(lengths, Lengths(vec![1, 6, 3]));
}

#[tokio::test]
async fn undeclared_gets_fail() {
    let mut tasks = Tasks::new();
    tasks
        .rule(Rule::new("length", |_ctx: Context, (word,): (Word,)| async move {
            Ok::<_, Failure>(Length(word.0.len()))
        }))
        .rule(Rule::new("sneaky", |ctx: Context, (words,): (Words,)| async move {
            let first: Length = ctx.get(Word(words.0[0].clone())).await?;
            Ok::<_, Failure>(Lengths(vec![first.0]))
        }))
        .query::<Lengths, (Words,)>()
        .query::<Length, (Word,)>();
    let scheduler = Scheduler::new(tasks, Store::new(), config()).unwrap();
    let err = scheduler
        .session()
        .product_request::<Lengths>(params(vec![Value::new(Words(vec!["a".into()]))]))
        .await
        .unwrap_err();
    assert_eq!(
        err.message(),
        "sneaky issued Get(Length, Word), which it did not declare"
    );
    assert_eq!(err.engine_traceback(), ["sneaky"]);
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Compiled;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Packaged;

#[tokio::test]
async fn failures_carry_an_engine_traceback() {
    let mut tasks = Tasks::new();
    tasks
        .rule(Rule::new("compile", |_ctx: Context, (_name,): (Name,)| async move {
            Err::<Compiled, _>(Failure::throw("syntax error"))
        }))
        .rule(Rule::new("package", |_ctx: Context, (_compiled,): (Compiled,)| async move {
            Ok::<_, Failure>(Packaged)
        }))
        .query::<Packaged, (Name,)>();
    let scheduler = Scheduler::new(tasks, Store::new(), config()).unwrap();
    let err = scheduler
        .session()
        .product_request::<Packaged>(params(vec![Value::new(Name("lib".to_owned()))]))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "syntax error\n\nEngine traceback:\n  in compile\n  in package"
    );
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct FileCount(usize);

#[tokio::test]
async fn changed_files_invalidate_their_readers() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("src")).unwrap();
    fs::write(dir.path().join("src/a.txt"), "a").unwrap();

    let counts = Counter::default();
    let rule_counts = counts.clone();
    let mut tasks = Tasks::new();
    tasks
        .rule(
            Rule::new("count_files", move |ctx: Context, (globs,): (PathGlobs,)| {
                rule_counts.bump();
                async move {
                    let snapshot: Snapshot = ctx.get(globs).await?;
                    Ok::<_, Failure>(FileCount(snapshot.files.len()))
                }
            })
            .get::<Snapshot, PathGlobs>(),
        )
        .query::<FileCount, (PathGlobs,)>();
    let scheduler = Scheduler::new(
        tasks,
        Store::new(),
        ExecutionConfig {
            build_root: dir.path().to_owned(),
            ..config()
        },
    )
    .unwrap();
    let request = || params(vec![Value::new(PathGlobs::new(vec!["src/*.txt"]))]);

    let count: FileCount = scheduler.session().product_request(request()).await.unwrap();
    assert_eq!(count, FileCount(1));
    let count: FileCount = scheduler.session().product_request(request()).await.unwrap();
    assert_eq!(count, FileCount(1));
    assert_eq!(counts.get(), 1);

    assert_eq!(scheduler.invalidate_files(&["docs/readme.md"]).cleared, 0);

    fs::write(dir.path().join("src/b.txt"), "b").unwrap();
    let invalidated = scheduler.invalidate_files(&[dir.path().join("src/b.txt")]);
    assert!(invalidated.cleared > 0);
    let count: FileCount = scheduler.session().product_request(request()).await.unwrap();
    assert_eq!(count, FileCount(2));
    assert_eq!(counts.get(), 2);
}

#[tokio::test]
async fn converting_back_to_a_digest_is_not_ambiguous() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), "a").unwrap();
    let mut tasks = Tasks::new();
    tasks
        .rule(Rule::new("snapshot_to_digest", |_ctx: Context, (snapshot,): (Snapshot,)| async move {
            Ok::<_, Failure>(snapshot.digest)
        }))
        .query::<Digest, (PathGlobs,)>()
        .query::<Digest, (Snapshot,)>();
    let store = Store::new();
    let scheduler = Scheduler::new(
        tasks,
        store.clone(),
        ExecutionConfig {
            build_root: dir.path().to_owned(),
            ..config()
        },
    )
    .unwrap();
    let digest: Digest = scheduler
        .session()
        .product_request(params(vec![Value::new(PathGlobs::new(vec!["*.txt"]))]))
        .await
        .unwrap();
    assert_eq!(store.snapshot(digest).unwrap().files, vec![PathBuf::from("a.txt")]);
}

#[tokio::test]
async fn digest_entries_and_paths_do_not_read_contents() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("src/nested")).unwrap();
    fs::write(dir.path().join("src/a.txt"), "a").unwrap();
    fs::write(dir.path().join("src/nested/b.txt"), "b").unwrap();
    let mut tasks = Tasks::new();
    tasks
        .query::<Paths, (PathGlobs,)>()
        .query::<DigestEntries, (Digest,)>();
    let store = Store::new();
    let scheduler = Scheduler::new(
        tasks,
        store.clone(),
        ExecutionConfig {
            build_root: dir.path().to_owned(),
            ..config()
        },
    )
    .unwrap();
    let session = scheduler.session();

    let paths: Paths = session
        .product_request(params(vec![Value::new(PathGlobs::new(vec!["src/*"]))]))
        .await
        .unwrap();
    assert_eq!(
        paths,
        Paths {
            files: vec![PathBuf::from("src/a.txt")],
            dirs: vec![PathBuf::from("src/nested")],
        }
    );

    let digest = store
        .create_digest(&CreateDigest::from(vec![FileContent::new("x.txt", "x").executable()]))
        .unwrap();
    let entries: DigestEntries = session
        .product_request(params(vec![Value::new(digest)]))
        .await
        .unwrap();
    assert_eq!(
        entries,
        DigestEntries(vec![DigestEntry::File {
            path: PathBuf::from("x.txt"),
            digest: Digest::of_bytes(b"x"),
            is_executable: true,
        }])
    );
}

#[tokio::test]
async fn rules_requesting_themselves_fail_with_a_cycle() {
    let mut tasks = Tasks::new();
    tasks
        .rule(
            Rule::new("count_down", |ctx: Context, (word,): (Word,)| async move {
                // Never shortens the word.
                let rest: Length = ctx.get(word.clone()).await?;
                Ok::<_, Failure>(Length(rest.0 + 1))
            })
            .get::<Length, Word>(),
        )
        .query::<Length, (Word,)>();
    let scheduler = Scheduler::new(tasks, Store::new(), config()).unwrap();
    let err = scheduler
        .session()
        .product_request::<Length>(params(vec![Value::new(Word("abc".to_owned()))]))
        .await
        .unwrap_err();
    assert!(
        err.message()
            .starts_with("Dependency graph contained a cycle:\n  count_down("),
        "{}",
        err
    );
    assert!(err.message().contains("\n  -> count_down("), "{}", err);
    assert_eq!(err.engine_traceback(), ["count_down"]);
}

#[tokio::test]
async fn rules_cycling_through_inputs_fail_to_compile() {
    let mut tasks = Tasks::new();
    tasks
        .rule(Rule::new("package", |_ctx: Context, (_compiled,): (Compiled,)| async move {
            Ok::<_, Failure>(Packaged)
        }))
        .rule(Rule::new("unpack", |_ctx: Context, (_packaged,): (Packaged,)| async move {
            Ok::<_, Failure>(Compiled)
        }))
        .query::<Packaged, (Name,)>();
    match Scheduler::new(tasks, Store::new(), config()) {
        Err(err) => assert!(
            err.to_string().starts_with("No rule can compute Packaged for (Name)"),
            "{}",
            err
        ),
        Ok(_) => panic!("expected the cycle to be rejected"),
    }
}

#[tokio::test]
async fn panicking_rules_fail_instead_of_hanging() {
    let runs = Counter::default();
    let rule_runs = runs.clone();
    let mut tasks = Tasks::new();
    tasks
        .rule(Rule::new("explode", move |_ctx: Context, (name,): (Name,)| {
            rule_runs.bump();
            async move {
                if name.0 == "boom" {
                    panic!("rule bug");
                }
                Ok::<_, Failure>(Greeting(name.0))
            }
        }))
        .rule(Rule::new("shout", |_ctx: Context, (greeting,): (Greeting,)| async move {
            Ok::<_, Failure>(Shout(greeting.0.to_uppercase()))
        }))
        .query::<Shout, (Name,)>();
    let scheduler = Scheduler::new(tasks, Store::new(), config()).unwrap();
    let request = || params(vec![Value::new(Name("boom".to_owned()))]);

    let session = scheduler.session();
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        session.product_request::<Shout>(request()),
    )
    .await
    .expect("the session should not hang")
    .unwrap_err();
    assert!(err.message().starts_with("explode("), "{}", err);
    assert!(err.message().ends_with(" panicked: rule bug"), "{}", err);
    assert_eq!(err.engine_traceback(), ["shout"]);

    // The failure is memoized like any other.
    session.product_request::<Shout>(request()).await.unwrap_err();
    assert_eq!(runs.get(), 1);
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Report {
    exit_code: i32,
    lines: Vec<String>,
}

impl Goal for Report {
    fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

#[tokio::test]
async fn goals_run_once_per_session() {
    let runs = Counter::default();
    let goal_runs = runs.clone();
    let mut tasks = Tasks::new();
    tasks
        .rule(
            Rule::new("report", move |_ctx: Context, (name,): (Name,)| {
                goal_runs.bump();
                async move {
                    Ok::<_, Failure>(Report {
                        exit_code: 0,
                        lines: vec![name.0],
                    })
                }
            })
            .goal(),
        )
        .query::<Report, (Name,)>();
    let scheduler = Scheduler::new(tasks, Store::new(), config()).unwrap();
    let request = || params(vec![Value::new(Name("x".to_owned()))]);

    let session = scheduler.session();
    let report: Report = session.product_request(request()).await.unwrap();
    assert_eq!(report.exit_code(), 0);
    session.product_request::<Report>(request()).await.unwrap();
    assert_eq!(runs.get(), 1);

    scheduler
        .session()
        .product_request::<Report>(request())
        .await
        .unwrap();
    assert_eq!(runs.get(), 2);
}

// A union of things that can be formatted.
struct Fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Sources(Vec<String>);

impl Field for Sources {
    const ALIAS: &'static str = "sources";
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SkipFmt(bool);

impl Field for SkipFmt {
    const ALIAS: &'static str = "skip_fmt";
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RustFmtFieldSet {
    address: Address,
    sources: Sources,
}

impl FieldSet for RustFmtFieldSet {
    fn required_fields() -> Vec<TypeId> {
        vec![TypeId::of::<Sources>()]
    }

    fn create(target: &Target) -> Result<Self, InvalidFieldException> {
        Ok(RustFmtFieldSet {
            address: target.address().clone(),
            sources: target.require::<Sources>()?.clone(),
        })
    }

    fn opt_out(target: &Target) -> bool {
        target.get::<SkipFmt>().map_or(false, |skip| skip.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct MarkdownFile(String);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Formatted(String);

fn fmt_tasks() -> Tasks {
    let mut tasks = Tasks::new();
    tasks
        .rule(Rule::new(
            "rustfmt",
            |_ctx: Context, (field_set,): (RustFmtFieldSet,)| async move {
                Ok::<_, Failure>(Formatted(format!(
                    "rustfmt {}: {}",
                    field_set.address,
                    field_set.sources.0.join(" ")
                )))
            },
        ))
        .rule(Rule::new(
            "mdformat",
            |_ctx: Context, (file,): (MarkdownFile,)| async move {
                Ok::<_, Failure>(Formatted(format!("mdformat {}", file.0)))
            },
        ))
        .rule(
            Rule::new("fmt", |ctx: Context, (targets,): (Targets,)| async move {
                let mut lines = Vec::new();
                for target in &targets.0 {
                    for field_set in ctx.field_sets::<Fmt>(target, false)? {
                        let formatted: Formatted = ctx.get_union::<_, Fmt>(field_set).await?;
                        lines.push(formatted.0);
                    }
                }
                let readme = Value::new(MarkdownFile("README.md".to_owned()));
                let formatted: Formatted = ctx.get_union::<_, Fmt>(readme).await?;
                lines.push(formatted.0);
                Ok::<_, Failure>(Report {
                    exit_code: 0,
                    lines,
                })
            })
            .get_union::<Formatted, Fmt>()
            .goal(),
        )
        .field_set::<Fmt, RustFmtFieldSet>()
        .union_rule::<Fmt, MarkdownFile>()
        .query::<Report, (Targets,)>();
    tasks
}

#[tokio::test]
async fn union_gets_dispatch_on_the_member_type() {
    let scheduler = Scheduler::new(fmt_tasks(), Store::new(), config()).unwrap();
    let targets = Targets(vec![
        Target::new("rust_library", Address::new("src/lib", "lib"))
            .with_field(Sources(vec!["lib.rs".to_owned()])),
        Target::new("rust_library", Address::new("src/gen", "gen"))
            .with_field(Sources(vec!["gen.rs".to_owned()]))
            .with_field(SkipFmt(true)),
        Target::new("files", Address::new("docs", "docs")),
    ]);
    let report: Report = scheduler
        .session()
        .product_request(params(vec![Value::new(targets)]))
        .await
        .unwrap();
    assert_eq!(
        report.lines,
        vec!["rustfmt src/lib:lib: lib.rs", "mdformat README.md"]
    );
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct NotAMember;

#[tokio::test]
async fn union_gets_reject_non_members() {
    let mut tasks = fmt_tasks();
    tasks
        .rule(
            Rule::new("bad_fmt", |ctx: Context, (_name,): (Name,)| async move {
                let formatted: Formatted = ctx.get_union::<_, Fmt>(Value::new(NotAMember)).await?;
                Ok::<_, Failure>(Report {
                    exit_code: 0,
                    lines: vec![formatted.0],
                })
            })
            .get_union::<Formatted, Fmt>()
            .goal(),
        )
        .query::<Report, (Name,)>();
    let scheduler = Scheduler::new(tasks, Store::new(), config()).unwrap();
    let err = scheduler
        .session()
        .product_request::<Report>(params(vec![Value::new(Name("x".to_owned()))]))
        .await
        .unwrap_err();
    assert_eq!(err.message(), "NotAMember is not a member of the union Fmt");
}
