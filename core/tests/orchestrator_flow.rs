use std::time::Duration;

use assert_matches::assert_matches;
use core_test_support::FailingSink;
use core_test_support::Harness;
use core_test_support::pane;
use core_test_support::wait_until;
use panewatch_core::ErrorKind;
use panewatch_core::Operation;
use panewatch_core::OperationResponse;
use panewatch_core::OrchestratorError;
use panewatch_core::classifier::Severity;
use panewatch_core::coordinator::TriggerCondition;
use panewatch_core::coordinator::TriggerRule;
use panewatch_core::dispatch;
use panewatch_core::exec::TerminationOutcome;
use panewatch_core::registry::PaneOrigin;
use panewatch_core::watcher::WatcherState;
use pretty_assertions::assert_eq;
use serde_json::json;
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(5);

async fn create_dev(harness: &Harness, windows: &[&str]) {
    harness
        .orchestrator
        .create_session(
            Some("dev".to_string()),
            Some(harness.dir.path().to_path_buf()),
            windows.iter().map(|window| (*window).to_string()).collect(),
        )
        .await
        .expect("create session");
}

async fn wait_for_entries(harness: &Harness, address: &str, count: usize) -> bool {
    let orchestrator = &harness.orchestrator;
    let address = pane(address);
    let address = &address;
    wait_until(WAIT, || async move {
        orchestrator
            .errors_summary(address, None, None)
            .await
            .is_ok_and(|summary| summary.entries.len() >= count)
    })
    .await
}

fn rule(id: &str, sink: &str, condition: TriggerCondition, debounce_ms: u64) -> TriggerRule {
    TriggerRule {
        id: id.to_string(),
        sink: sink.to_string(),
        condition,
        debounce_ms: Some(debounce_ms),
        pane: None,
    }
}

#[tokio::test]
async fn npm_start_node_error_shows_up_in_summary() {
    let harness = Harness::new();
    harness.backend.respond(
        "npm start",
        &[
            "> app@1.0.0 start",
            "> node server.js",
            "/app/server.js:12",
            "TypeError: Cannot read properties of undefined (reading 'port')",
            "    at Object.<anonymous> (/app/server.js:12:20)",
        ],
    );
    create_dev(&harness, &["main"]).await;
    let dev = pane("dev:main.0");

    harness
        .orchestrator
        .errors_watch(&dev, vec!["node".to_string()], None)
        .await
        .expect("watch");
    let updated = harness
        .orchestrator
        .execute_command(&dev, "npm start")
        .await
        .expect("execute");
    assert_eq!(updated.command.as_deref(), Some("npm start"));

    assert!(wait_for_entries(&harness, "dev:main.0", 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let summary = harness
        .orchestrator
        .errors_summary(&dev, None, None)
        .await
        .expect("summary");
    assert_eq!(summary.entries.len(), 1);
    let entry = &summary.entries[0];
    assert_eq!(entry.severity, Severity::Error);
    assert_eq!(entry.pattern, "node-error");
    assert_eq!(entry.fields.get("type").map(String::as_str), Some("TypeError"));
    assert_eq!(entry.pane, dev);
}

#[tokio::test]
async fn sessions_with_equal_window_names_keep_separate_logs() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    harness
        .orchestrator
        .create_session(
            Some("api".to_string()),
            Some(harness.dir.path().to_path_buf()),
            vec!["main".to_string()],
        )
        .await
        .expect("create api");
    let dev = pane("dev:main.0");
    let api = pane("api:main.0");

    let dev_log = harness.orchestrator.resolve_pane(&dev).await.expect("dev").log_path;
    let api_log = harness.orchestrator.resolve_pane(&api).await.expect("api").log_path;
    assert_ne!(dev_log, api_log);

    for address in [&dev, &api] {
        harness
            .orchestrator
            .errors_watch(address, Vec::new(), None)
            .await
            .expect("watch");
    }
    harness.backend.emit(&dev, "TypeError: only dev crashed\n");

    assert!(wait_for_entries(&harness, "dev:main.0", 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let api_summary = harness
        .orchestrator
        .errors_summary(&api, None, None)
        .await
        .expect("summary");
    assert!(api_summary.entries.is_empty());
}

#[tokio::test]
async fn destroying_unknown_session_is_not_found_and_retryable() {
    let harness = Harness::new();
    let err = harness
        .orchestrator
        .destroy_session("dev")
        .await
        .expect_err("nothing to destroy");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    create_dev(&harness, &["main"]).await;
    let report = harness
        .orchestrator
        .destroy_session("dev")
        .await
        .expect("destroy");
    assert_eq!(report.panes.len(), 1);
    assert_eq!(report.panes[0].outcome, TerminationOutcome::Graceful);
    assert!(!harness.backend.is_tracked(&pane("dev:main.0")));
    assert_matches!(
        harness.orchestrator.resolve_pane(&pane("dev:main.0")).await,
        Err(OrchestratorError::PaneNotFound { .. })
    );
    assert_matches!(
        harness.orchestrator.destroy_session("dev").await,
        Err(OrchestratorError::SessionNotFound { .. })
    );

    create_dev(&harness, &["main"]).await;
    harness
        .orchestrator
        .resolve_pane(&pane("dev:main.0"))
        .await
        .expect("recreated session resolves");
}

#[tokio::test]
async fn threshold_burst_fires_exactly_once() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    let dev = pane("dev:main.0");
    harness
        .orchestrator
        .add_trigger_rule(rule(
            "burst",
            "ops",
            TriggerCondition::Threshold {
                count: 3,
                min_severity: Severity::Error,
                window_ms: Some(60_000),
                pattern: None,
            },
            60_000,
        ))
        .await
        .expect("rule");
    harness
        .orchestrator
        .errors_watch(&dev, Vec::new(), None)
        .await
        .expect("watch");

    for i in 0..10 {
        harness.backend.emit(&dev, &format!("TypeError: boom {i}\n"));
    }
    assert!(wait_for_entries(&harness, "dev:main.0", 10).await);
    let events = harness.sink.wait_for(1, WAIT).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let events_after = harness.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events_after.len(), 1);
    assert_eq!(events_after[0].rule_id, "burst");
    assert_eq!(events_after[0].pane, dev);
    assert_eq!(events_after[0].context["count"], json!(3));
}

#[tokio::test]
async fn unexpected_exit_fires_and_requested_termination_does_not() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    harness
        .orchestrator
        .add_trigger_rule(rule("exit", "ops", TriggerCondition::ProcessExited, 0))
        .await
        .expect("rule");
    let extra = harness
        .orchestrator
        .create_pane(&"dev:main".parse().expect("window"), None, Default::default())
        .await
        .expect("pane");
    assert_eq!(extra.address, pane("dev:main.1"));

    harness.backend.exit(&pane("dev:main.0"), Some(1));
    let events = harness.sink.wait_for(1, WAIT).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].pane, pane("dev:main.0"));
    assert_eq!(events[0].context["exit_code"], json!(1));

    harness
        .orchestrator
        .remove_pane(&extra.address)
        .await
        .expect("remove");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.sink.events().len(), 1);
}

#[tokio::test]
async fn exited_shell_is_respawned_for_the_next_command() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    let dev = pane("dev:main.0");
    let before = harness.orchestrator.resolve_pane(&dev).await.expect("pane");

    harness.backend.exit(&dev, Some(0));
    let after = harness
        .orchestrator
        .execute_command(&dev, "cargo test")
        .await
        .expect("execute after respawn");
    assert_ne!(after.pid, before.pid);
    assert_eq!(harness.backend.inputs(&dev), vec!["cargo test\n".to_string()]);
}

#[tokio::test]
async fn unsafe_commands_never_reach_the_backend() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    let dev = pane("dev:main.0");

    for command in ["rm -rf /", "echo $(whoami)", "ls; reboot", "echo 'open"] {
        let err = harness
            .orchestrator
            .execute_command(&dev, command)
            .await
            .expect_err(command);
        assert_eq!(err.kind(), ErrorKind::UnsafeCommand, "{command}");
    }
    assert!(harness.backend.inputs(&dev).is_empty());

    let err = harness
        .orchestrator
        .create_pane(
            &"dev:main".parse().expect("window"),
            Some(":(){ :|:& };:"),
            Default::default(),
        )
        .await
        .expect_err("fork bomb");
    assert_eq!(err.kind(), ErrorKind::UnsafeCommand);
    let session = harness.orchestrator.registry().session("dev").await.expect("session");
    assert_eq!(session.pane_count(), 1);
}

#[tokio::test]
async fn denied_command_sent_in_pieces_is_never_submitted() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    let dev = pane("dev:main.0");
    let orchestrator = &harness.orchestrator;

    orchestrator.send_input(&dev, b"rm -rf ").await.expect("partial");
    orchestrator.send_input(&dev, b"/").await.expect("partial");
    let err = orchestrator
        .send_input(&dev, b"\r")
        .await
        .expect_err("completed line is denied");
    assert_eq!(err.kind(), ErrorKind::UnsafeCommand);
    assert_eq!(harness.backend.inputs(&dev), vec!["rm -rf ", "/"]);
    orchestrator.send_input(&dev, b"\x03").await.expect("ctrl-c");

    orchestrator.send_input(&dev, b"rm -rf ").await.expect("partial");
    let err = orchestrator
        .execute_command(&dev, "/")
        .await
        .expect_err("command completes the pending line");
    assert_eq!(err.kind(), ErrorKind::UnsafeCommand);

    orchestrator.send_input(&dev, b"\x03").await.expect("ctrl-c");
    orchestrator.execute_command(&dev, "ls").await.expect("clean line");
    assert_eq!(harness.backend.inputs(&dev).last().map(String::as_str), Some("ls\n"));
}

#[tokio::test]
async fn pane_indices_are_never_reused() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    let window = "dev:main".parse().expect("window");
    let orchestrator = &harness.orchestrator;

    let one = orchestrator
        .create_pane(&window, None, Default::default())
        .await
        .expect("pane");
    let two = orchestrator
        .create_pane(&window, None, Default::default())
        .await
        .expect("pane");
    orchestrator.remove_pane(&one.address).await.expect("remove");
    let three = orchestrator
        .create_pane(&window, None, Default::default())
        .await
        .expect("pane");

    assert_eq!(one.address, pane("dev:main.1"));
    assert_eq!(two.address, pane("dev:main.2"));
    assert_eq!(three.address, pane("dev:main.3"));
    assert_matches!(
        orchestrator.resolve_pane(&one.address).await,
        Err(OrchestratorError::PaneNotFound { .. })
    );
}

#[tokio::test]
async fn removed_window_terminates_its_panes_and_retires_numbering() {
    let harness = Harness::new();
    create_dev(&harness, &["main", "logs"]).await;
    let window = "dev:logs".parse().expect("window");
    let orchestrator = &harness.orchestrator;

    let terminated = orchestrator.remove_window(&window).await.expect("remove");
    assert_eq!(terminated.len(), 1);
    assert_eq!(terminated[0].pane, pane("dev:logs.0"));
    assert!(!harness.backend.is_tracked(&pane("dev:logs.0")));

    let readded = orchestrator.create_window(&window).await.expect("re-add");
    assert_eq!(readded.panes.keys().copied().collect::<Vec<_>>(), vec![1]);
    assert_matches!(
        orchestrator.remove_window(&"dev:gone".parse().expect("window")).await,
        Err(err) if err.kind() == ErrorKind::NotFound
    );
}

#[tokio::test]
async fn rewatch_resumes_where_unwatch_stopped() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    let dev = pane("dev:main.0");
    let orchestrator = &harness.orchestrator;

    orchestrator
        .errors_watch(&dev, Vec::new(), None)
        .await
        .expect("watch");
    harness.backend.emit(&dev, "TypeError: first\n");
    assert!(wait_for_entries(&harness, "dev:main.0", 1).await);

    let stopped = orchestrator.errors_unwatch(&dev).await.expect("unwatch");
    assert_eq!(stopped.state, WatcherState::Stopped);
    assert_eq!(stopped.offset, "TypeError: first\n".len() as u64);
    assert_matches!(
        orchestrator.errors_unwatch(&dev).await,
        Err(OrchestratorError::WatchNotFound { .. })
    );

    harness.backend.emit(&dev, "TypeError: second\n");
    let resumed = orchestrator
        .errors_watch(&dev, Vec::new(), None)
        .await
        .expect("watch again");
    assert_eq!(resumed.offset, stopped.offset);
    assert!(wait_for_entries(&harness, "dev:main.0", 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let summary = orchestrator
        .errors_summary(&dev, None, None)
        .await
        .expect("summary");
    let lines: Vec<_> = summary.entries.iter().map(|entry| entry.line.as_str()).collect();
    assert_eq!(lines, vec!["TypeError: first", "TypeError: second"]);
    let line_numbers: Vec<_> = summary.entries.iter().map(|entry| entry.line_no).collect();
    assert_eq!(line_numbers, vec![1, 2]);
    assert_eq!(summary.total_seen, 2);
}

#[tokio::test]
async fn timed_watch_stops_on_its_own() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    let dev = pane("dev:main.0");
    let orchestrator = &harness.orchestrator;
    orchestrator
        .errors_watch(&dev, Vec::new(), Some(Duration::from_millis(50)))
        .await
        .expect("watch");

    let dev_ref = &dev;
    let stopped = wait_until(WAIT, || async move {
        orchestrator
            .watch_status(dev_ref)
            .await
            .is_some_and(|status| status.state == WatcherState::Stopped)
    })
    .await;
    assert!(stopped);
}

#[tokio::test]
async fn failing_sink_is_swallowed_and_firing_still_counts() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    let dev = pane("dev:main.0");
    let orchestrator = &harness.orchestrator;
    orchestrator
        .register_sink(FailingSink::new("broken"))
        .await
        .expect("register");
    let occurrence = TriggerCondition::Occurrence {
        pattern: "node-error".to_string(),
    };
    orchestrator
        .add_trigger_rule(rule("to-broken", "broken", occurrence.clone(), 0))
        .await
        .expect("rule");
    orchestrator
        .add_trigger_rule(rule("to-ops", "ops", occurrence, 0))
        .await
        .expect("rule");
    assert_matches!(
        orchestrator
            .add_trigger_rule(rule("nowhere", "missing", TriggerCondition::PortClosed, 0))
            .await,
        Err(OrchestratorError::SinkNotFound { .. })
    );

    orchestrator
        .errors_watch(&dev, vec!["node".to_string()], None)
        .await
        .expect("watch");
    harness.backend.emit(&dev, "RangeError: Maximum call stack size exceeded\n");
    let events = harness.sink.wait_for(1, WAIT).await;
    assert_eq!(events.len(), 1);

    let rules = orchestrator.list_trigger_rules().await.expect("rules");
    let broken = rules
        .iter()
        .find(|status| status.rule.id == "to-broken")
        .expect("rule listed");
    assert_eq!(broken.fire_count, 1);
}

#[tokio::test]
async fn recovery_round_trip_adopts_live_panes() {
    let harness = Harness::new();
    create_dev(&harness, &["main", "api"]).await;
    harness
        .orchestrator
        .create_pane(&"dev:main".parse().expect("window"), None, Default::default())
        .await
        .expect("pane");
    let before = harness
        .orchestrator
        .registry()
        .session("dev")
        .await
        .expect("session");
    assert_eq!(harness.orchestrator.snapshot_all().await.expect("snapshot"), 1);

    let harness = harness.restart().await;
    let report = harness.orchestrator.recover().await.expect("recover");
    assert_eq!(report.recovered, vec!["dev".to_string()]);
    assert!(report.discarded.is_empty());

    let after = harness
        .orchestrator
        .registry()
        .session("dev")
        .await
        .expect("recovered session");
    assert_eq!(after.pane_count(), 3);
    let before_panes: Vec<_> = before.panes().map(|p| (p.address.clone(), p.pid)).collect();
    let after_panes: Vec<_> = after.panes().map(|p| (p.address.clone(), p.pid)).collect();
    assert_eq!(after_panes, before_panes);
    assert!(after.panes().all(|p| p.origin == PaneOrigin::Recovered));

    let err = harness
        .orchestrator
        .execute_command(&pane("dev:main.0"), "ls")
        .await
        .expect_err("recovered panes take no input");
    assert_eq!(err.kind(), ErrorKind::ProcessUnavailable);

    let next = harness
        .orchestrator
        .create_pane(&"dev:main".parse().expect("window"), None, Default::default())
        .await
        .expect("pane");
    assert_eq!(next.address, pane("dev:main.2"));
}

#[tokio::test]
async fn recovery_discards_session_with_a_dead_pane() {
    let harness = Harness::new();
    create_dev(&harness, &["main", "api"]).await;
    let api = harness
        .orchestrator
        .resolve_pane(&pane("dev:api.0"))
        .await
        .expect("pane");
    harness.orchestrator.snapshot_all().await.expect("snapshot");

    let harness = harness.restart().await;
    harness.backend.mark_dead(api.pid);
    let report = harness.orchestrator.recover().await.expect("recover");
    assert!(report.recovered.is_empty());
    assert_eq!(report.discarded.len(), 1);
    assert_eq!(report.discarded[0].source, "dev");
    assert!(harness.orchestrator.list_sessions().await.is_empty());
    assert!(
        !harness
            .orchestrator
            .config()
            .sessions_dir()
            .join("dev.json")
            .exists()
    );
}

#[tokio::test]
async fn recovery_refuses_a_pid_recycled_by_another_process() {
    let harness = Harness::new();
    create_dev(&harness, &["main", "api"]).await;
    let api = harness
        .orchestrator
        .resolve_pane(&pane("dev:api.0"))
        .await
        .expect("pane");
    harness.orchestrator.snapshot_all().await.expect("snapshot");

    let harness = harness.restart().await;
    harness.backend.recycle_pid(api.pid);
    let signals_before = harness.backend.signals().len();
    let report = harness.orchestrator.recover().await.expect("recover");

    assert!(report.recovered.is_empty());
    assert_eq!(report.discarded.len(), 1);
    assert!(report.discarded[0].reason.contains("another process"));
    assert!(harness.orchestrator.list_sessions().await.is_empty());

    let err = harness
        .orchestrator
        .destroy_session("dev")
        .await
        .expect_err("nothing to destroy");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(harness.backend.signals().len(), signals_before);
}

#[tokio::test]
async fn recovery_keeps_the_record_of_a_session_that_is_already_live() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    harness.orchestrator.snapshot_all().await.expect("snapshot");

    let report = harness.orchestrator.recover().await.expect("recover");

    assert!(report.recovered.is_empty());
    assert!(report.discarded.is_empty());
    assert_eq!(report.skipped, vec!["dev".to_string()]);
    assert!(
        harness
            .orchestrator
            .config()
            .sessions_dir()
            .join("dev.json")
            .exists()
    );
    let live = harness
        .orchestrator
        .resolve_pane(&pane("dev:main.0"))
        .await
        .expect("pane");
    assert_eq!(live.origin, PaneOrigin::Spawned);
    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn failed_adoption_releases_panes_adopted_before_it() {
    let harness = Harness::new();
    create_dev(&harness, &["main", "api"]).await;
    harness.orchestrator.snapshot_all().await.expect("snapshot");

    let harness = harness.restart().await;
    harness.backend.fail_adopt(&pane("dev:api.0"));
    let report = harness.orchestrator.recover().await.expect("recover");

    assert!(report.recovered.is_empty());
    assert_eq!(report.discarded.len(), 1);
    assert!(!harness.backend.is_tracked(&pane("dev:main.0")));
    assert!(harness.orchestrator.list_sessions().await.is_empty());
}

#[tokio::test]
#[traced_test]
async fn termination_escalates_when_sigterm_is_ignored() {
    let harness = Harness::new();
    create_dev(&harness, &["main"]).await;
    harness.backend.ignore_terminate(true);

    let report = harness
        .orchestrator
        .destroy_session("dev")
        .await
        .expect("destroy succeeds despite timeout");
    assert_eq!(report.panes[0].outcome, TerminationOutcome::ForceKilled);
    assert!(!harness.backend.is_tracked(&pane("dev:main.0")));
    assert!(logs_contain("escalating to force kill"));
}

#[tokio::test]
#[traced_test]
async fn destroying_a_session_joins_its_port_monitors() {
    let harness = Harness::new();
    create_dev(&harness, &["web"]).await;
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let web = pane("dev:web.0");
    harness
        .orchestrator
        .monitor_port(&web, port, Some(Duration::from_millis(10)))
        .await
        .expect("monitor");
    // Monitoring again replaces the running probe.
    harness
        .orchestrator
        .monitor_port(&web, port, Some(Duration::from_millis(10)))
        .await
        .expect("monitor again");
    assert!(logs_contain("port monitor joined"));

    harness
        .orchestrator
        .destroy_session("dev")
        .await
        .expect("destroy");
    logs_assert(|lines: &[&str]| {
        match lines
            .iter()
            .filter(|line| line.contains("port monitor joined"))
            .count()
        {
            2 => Ok(()),
            n => Err(format!("expected 2 joined monitors, saw {n}")),
        }
    });
    drop(listener);
}

#[tokio::test]
async fn operations_dispatch_to_tagged_results() {
    let harness = Harness::new();
    let orchestrator = &harness.orchestrator;

    let op: Operation = serde_json::from_value(json!({
        "op": "create_session",
        "name": "dev",
        "working_dir": harness.dir.path(),
    }))
    .expect("op");
    let created = dispatch(orchestrator, op).await;
    assert!(created.is_ok());

    let op: Operation = serde_json::from_value(json!({
        "op": "resolve_pane",
        "pane": "dev:main.0",
    }))
    .expect("op");
    assert_matches!(
        dispatch(orchestrator, op).await,
        OperationResponse::Ok { result } if result["origin"] == json!("spawned")
    );

    let op: Operation =
        serde_json::from_value(json!({ "op": "destroy_session", "name": "ghost" })).expect("op");
    let response = serde_json::to_value(dispatch(orchestrator, op).await).expect("encode");
    assert_eq!(response["status"], json!("error"));
    assert_eq!(response["error"]["kind"], json!("not_found"));
}

#[tokio::test]
async fn removing_an_unknown_pattern_is_a_no_op() {
    let harness = Harness::new();
    let orchestrator = &harness.orchestrator;
    let remove = |name: &str| -> Operation {
        serde_json::from_value(json!({ "op": "errors_remove_pattern", "name": name })).expect("op")
    };

    assert_matches!(
        dispatch(orchestrator, remove("npm-err")).await,
        OperationResponse::Ok { result } if result["removed"] == json!(true)
    );
    assert_matches!(
        dispatch(orchestrator, remove("npm-err")).await,
        OperationResponse::Ok { result } if result["removed"] == json!(false)
    );
    assert!(
        orchestrator
            .errors_list_patterns()
            .iter()
            .all(|pattern| pattern.name != "npm-err")
    );
}
