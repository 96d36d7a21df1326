//! Integration tests for the scan pipeline
//!
//! Runs whole tasks through the service with the in-process pool backend.

use scanservice_protocol::{
    AnalyzerOptions, AttributeMapping, Deadline, ScanRequest, TaskId, TaskState,
};
use scanservice_sentinel::{
    Dispatcher, DispatcherConfig, IgnoreRules, OutputWriter, ScanService, TaskRegistry,
};
use scanservice_worker::{Analyzer, AnalyzerError, AnalyzerRegistry, PoolConfig, WorkerPool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Fails on any file named `poison.txt`, after a short pause.
struct Poison;

impl Analyzer for Poison {
    fn name(&self) -> &'static str {
        "poison"
    }

    fn scan(
        &self,
        location: &Path,
        _deadline: Deadline,
        _options: &AnalyzerOptions,
    ) -> Result<AttributeMapping, AnalyzerError> {
        std::thread::sleep(Duration::from_millis(10));
        if location.ends_with("poison.txt") {
            return Err(AnalyzerError::Failed("poisoned".to_string()));
        }
        Ok(AttributeMapping {
            scan_errors: Some(Vec::new()),
            ..Default::default()
        })
    }
}

/// Sleeps long enough to be cancelled.
struct Sleepy;

impl Analyzer for Sleepy {
    fn name(&self) -> &'static str {
        "sleepy"
    }

    fn scan(
        &self,
        _location: &Path,
        _deadline: Deadline,
        _options: &AnalyzerOptions,
    ) -> Result<AttributeMapping, AnalyzerError> {
        std::thread::sleep(Duration::from_millis(300));
        Ok(AttributeMapping::default())
    }
}

fn service(registry: AnalyzerRegistry, analyzers: &[&str]) -> ScanService {
    let pool = WorkerPool::start(PoolConfig::in_process(3, registry));
    let writer = OutputWriter::start(2).unwrap();
    let config = DispatcherConfig::for_pool(3).with_analyzers(analyzers.iter().copied());
    let dispatcher = Dispatcher::new(pool, writer, Arc::new(IgnoreRules::default()), config);
    ScanService::new(dispatcher, TaskRegistry::new(Duration::from_secs(60)))
}

fn project(files: usize) -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("project");
    std::fs::create_dir_all(root.join("nested/deeper")).unwrap();
    std::fs::create_dir_all(root.join(".git")).unwrap();
    std::fs::write(root.join(".git/config"), "[core]").unwrap();
    for i in 0..files {
        let dir = match i % 3 {
            0 => root.clone(),
            1 => root.join("nested"),
            _ => root.join("nested/deeper"),
        };
        std::fs::write(
            dir.join(format!("file{i}.py")),
            format!("# SPDX-License-Identifier: Apache-2.0\n# Copyright 2024 Author {i}\nprint({i})\n"),
        )
        .unwrap();
    }
    (temp, root)
}

async fn wait_finished(service: &ScanService, id: TaskId) -> (TaskState, Option<String>) {
    for _ in 0..500 {
        let status = service.registry().status(id).unwrap();
        if status.status.is_finished() {
            return (status.status, status.error);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} did not finish");
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_scan_covers_every_file() {
    let (temp, root) = project(30);
    let output = temp.path().join("result.json");
    let service = service(AnalyzerRegistry::builtin(), &["file_info", "licenses", "copyrights"]);

    let accepted = service
        .submit(ScanRequest {
            scan_path: root.clone(),
            output_file: output.clone(),
        })
        .unwrap();
    let (state, error) = wait_finished(&service, accepted.uuid).await;
    assert_eq!(state, TaskState::Done, "error: {error:?}");

    let value = read_json(&output);
    let files = value["files"].as_array().unwrap();
    let scanned: Vec<&serde_json::Value> = files.iter().filter(|f| f["type"] == "file").collect();
    assert_eq!(scanned.len(), 30);
    assert!(files.iter().all(|f| !f["path"].as_str().unwrap().contains(".git")));
    for file in &scanned {
        assert_eq!(file["detected_license_expression"], "apache-2.0");
        assert_eq!(file["programming_language"], "Python");
        assert_eq!(file["holders"].as_array().unwrap().len(), 1);
    }

    let root_dir = &files[0];
    assert_eq!(root_dir["path"], "project");
    assert_eq!(root_dir["files_count"], 30);
    assert_eq!(root_dir["dirs_count"], 2);

    let detections = value["license_detections"].as_array().unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0]["detection_count"], 30);

    let header = &value["headers"][0];
    assert_eq!(header["tool_name"], "scanservice");
    assert_eq!(header["extra_data"]["counters"]["final:files_count"], 30);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_analyzer_fails_task_and_keeps_previous_output() {
    let (temp, root) = project(12);
    std::fs::write(root.join("nested/poison.txt"), "bad").unwrap();
    let output = temp.path().join("result.json");
    std::fs::write(&output, "previous").unwrap();

    let mut registry = AnalyzerRegistry::builtin();
    registry.register(Poison);
    let service = service(registry, &["file_info", "poison"]);

    let accepted = service
        .submit(ScanRequest {
            scan_path: root,
            output_file: output.clone(),
        })
        .unwrap();
    let (state, error) = wait_finished(&service, accepted.uuid).await;
    assert_eq!(state, TaskState::Failed);
    assert!(error.unwrap().contains("poisoned"));
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "previous");

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_file_scan() {
    let (temp, root) = project(1);
    let output = temp.path().join("single.json");
    let service = service(AnalyzerRegistry::builtin(), &["file_info", "licenses"]);

    let accepted = service
        .submit(ScanRequest {
            scan_path: root.join("file0.py"),
            output_file: output.clone(),
        })
        .unwrap();
    let (state, _) = wait_finished(&service, accepted.uuid).await;
    assert_eq!(state, TaskState::Done);

    let value = read_json(&output);
    let files = value["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["path"], "file0.py");
    assert_eq!(value["headers"][0]["options"]["base"], root.join("file0.py").display().to_string());

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_pending_scan() {
    let (temp, root) = project(40);
    let output = temp.path().join("result.json");
    let mut registry = AnalyzerRegistry::new();
    registry.register(Sleepy);
    let service = service(registry, &["sleepy"]);

    let accepted = service
        .submit(ScanRequest {
            scan_path: root,
            output_file: output.clone(),
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.registry().cancel(accepted.uuid).unwrap(), TaskState::Failed);

    let status = service.registry().status(accepted.uuid).unwrap();
    assert_eq!(status.error.as_deref(), Some("cancelled"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!output.exists());

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_are_independent() {
    let (temp, root) = project(9);
    let service = service(AnalyzerRegistry::builtin(), &["file_info"]);

    let outputs: Vec<PathBuf> = (0..3).map(|i| temp.path().join(format!("out{i}.json"))).collect();
    let ids: Vec<TaskId> = outputs
        .iter()
        .map(|output| {
            service
                .submit(ScanRequest {
                    scan_path: root.clone(),
                    output_file: output.clone(),
                })
                .unwrap()
                .uuid
        })
        .collect();

    for id in &ids {
        assert_eq!(wait_finished(&service, *id).await.0, TaskState::Done);
    }
    assert_eq!(service.registry().list().len(), 3);
    for output in &outputs {
        let value = read_json(output);
        let files = value["files"].as_array().unwrap();
        assert_eq!(files.iter().filter(|f| f["type"] == "file").count(), 9);
    }

    service.shutdown().await;
}
