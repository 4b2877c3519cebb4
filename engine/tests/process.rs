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

#![cfg(unix)]

use std::{fs, path::Path, time::Duration};

use knot_engine::{
    ExecutionConfig, FallibleProcessResult, Process, ProcessCacheScope, ProcessResult, Scheduler,
    Session, Tasks, TIMEOUT_EXIT_CODE,
};
use knot_rules::{Params, Value};
use knot_store::{CreateDigest, FileContent, Store};

fn scheduler(store: Store) -> Scheduler {
    scheduler_with(store, ExecutionConfig::default())
}

fn scheduler_with(store: Store, config: ExecutionConfig) -> Scheduler {
    let mut tasks = Tasks::new();
    tasks
        .query::<FallibleProcessResult, (Process,)>()
        .query::<ProcessResult, (Process,)>();
    Scheduler::new(tasks, store, config).unwrap()
}

fn sh(script: &str) -> Process {
    Process::new(vec!["/bin/sh", "-c", script])
}

async fn run(session: &Session, process: Process) -> FallibleProcessResult {
    session
        .product_request(Params::new(vec![Value::new(process)]))
        .await
        .unwrap()
}

#[tokio::test]
async fn captures_stdout_and_declared_outputs() {
    let store = Store::new();
    let input = store
        .create_digest(&CreateDigest::from(vec![FileContent::new(
            "in/greeting.txt",
            "hello",
        )]))
        .unwrap();
    let scheduler = scheduler(store.clone());
    let process = sh("cat in/greeting.txt; mkdir -p out/logs; cat in/greeting.txt > out/copy.txt; echo log > out/logs/a.log")
        .input_digest(input)
        .output_files(vec!["out/copy.txt", "missing.txt"])
        .output_directories(vec!["out/logs", "out/empty"]);
    let result: ProcessResult = scheduler
        .session()
        .product_request(Params::new(vec![Value::new(process)]))
        .await
        .unwrap();
    assert_eq!(&result.stdout[..], b"hello");
    assert_eq!(store.load_file_bytes(result.stdout_digest).unwrap(), result.stdout);

    let snapshot = store.snapshot(result.output_digest).unwrap();
    assert_eq!(
        snapshot.files,
        vec![Path::new("out/copy.txt"), Path::new("out/logs/a.log")]
    );
    assert_eq!(
        snapshot.dirs,
        vec![Path::new("out"), Path::new("out/empty"), Path::new("out/logs")]
    );
}

#[tokio::test]
async fn environment_is_replaced() {
    std::env::set_var("KNOT_PROCESS_TEST_LEAK", "leaked");
    let scheduler = scheduler(Store::new());
    let result = run(
        &scheduler.session(),
        sh("echo \"${KNOT_PROCESS_TEST_LEAK:-unset} $GREETING\"").env("GREETING", "hi"),
    )
    .await;
    assert_eq!(&result.stdout[..], b"unset hi\n");
}

#[tokio::test]
async fn failing_processes() {
    let scheduler = scheduler(Store::new());
    let session = scheduler.session();
    let process = sh("echo oops >&2; exit 3").description("compile lib");

    let fallible = run(&session, process.clone()).await;
    assert_eq!(fallible.exit_code, 3);
    assert_eq!(&fallible.stderr[..], b"oops\n");

    let err = session
        .product_request::<ProcessResult>(Params::new(vec![Value::new(process)]))
        .await
        .unwrap_err();
    assert_eq!(
        err.message(),
        "Process 'compile lib' failed with exit code 3.\nstdout:\n\nstderr:\noops"
    );
    assert_eq!(err.engine_traceback(), ["fallible_to_exec_result"]);
}

#[tokio::test]
async fn timeouts_kill_the_process() {
    let scheduler = scheduler(Store::new());
    let result = run(
        &scheduler.session(),
        sh("sleep 10").timeout(Duration::from_millis(100)),
    )
    .await;
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(String::from_utf8_lossy(&result.stderr).starts_with("Exceeded timeout of 0.1 seconds"));
}

#[tokio::test]
async fn timeouts_keep_partial_output() {
    let scheduler = scheduler(Store::new());
    let result = run(
        &scheduler.session(),
        sh("echo started; echo warming up >&2; sleep 10").timeout(Duration::from_millis(500)),
    )
    .await;
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(&result.stdout[..], b"started\n");
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(
        stderr.starts_with("warming up\nExceeded timeout of 0.5 seconds"),
        "{}",
        stderr
    );
}

#[tokio::test]
async fn output_paths_are_not_globs() {
    let store = Store::new();
    let scheduler = scheduler(store.clone());
    let process = sh("echo x > 'out[1].txt'; echo y > out1.txt").output_files(vec!["out[1].txt"]);
    let result = run(&scheduler.session(), process).await;
    let snapshot = store.snapshot(result.output_digest).unwrap();
    assert_eq!(snapshot.files, vec![Path::new("out[1].txt")]);
}

#[tokio::test]
async fn process_parallelism_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("events.log");
    let scheduler = scheduler_with(
        Store::new(),
        ExecutionConfig {
            process_parallelism: 2,
            ..ExecutionConfig::default()
        },
    );
    let session = scheduler.session();
    let requests = (0..5).map(|i| {
        let script = format!(
            "echo start >> {log}; sleep 0.2; echo end >> {log}; echo {i}",
            log = log.display(),
            i = i
        );
        run(&session, sh(&script))
    });
    let results = futures::future::join_all(requests).await;
    assert!(results.iter().all(|r| r.exit_code == 0));

    let mut running = 0;
    let mut most = 0;
    for event in fs::read_to_string(&log).unwrap().lines() {
        match event {
            "start" => running += 1,
            "end" => running -= 1,
            other => panic!("unexpected event {}", other),
        }
        most = most.max(running);
    }
    assert_eq!(running, 0);
    assert_eq!(most, 2);
}

#[tokio::test]
async fn cache_scope_controls_reruns() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("runs.log");
    let scheduler = scheduler(Store::new());
    let script = format!("echo run >> {}", log.display());

    for _ in 0..2 {
        run(&scheduler.session(), sh(&script)).await;
    }
    assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 1);

    let per_session = sh(&script).cache_scope(ProcessCacheScope::PerSession);
    for _ in 0..2 {
        let session = scheduler.session();
        run(&session, per_session.clone()).await;
        run(&session, per_session.clone()).await;
    }
    assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 3);
}

#[tokio::test]
async fn failures_are_not_kept_with_successful_scope() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("runs.log");
    let scheduler = scheduler(Store::new());
    let failing = sh(&format!("echo run >> {}; exit 1", log.display()));

    for _ in 0..2 {
        run(&scheduler.session(), failing.clone()).await;
    }
    assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 2);
}
