//! 链生命周期集成测试：启动、静默、停止、销毁，以及共享通道的状态取值。

mod support;

use std::time::Duration;

use spark_channelfw::{ChainEvent, FrameworkError, RuntimeState};
use support::{Fixture, PROTO, TCP};

fn single_chain() -> Fixture {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[("port", "11551")]);
    fixture.channel("app", PROTO, &[]);
    fixture.inbound("chain1", &["tcp", "app"]);
    fixture
}

#[test]
fn started_chain_exposes_plain_endpoint() {
    let fixture = single_chain();
    let framework = &fixture.framework;

    framework.start_chain("chain1").expect("start");

    assert_eq!(framework.get_chain_state("chain1").unwrap(), RuntimeState::Started);
    assert!(framework.is_chain_running("chain1"));
    let endpoint = framework.get_end_point("chain1").expect("endpoint");
    assert_eq!(endpoint.port(), 11551);
    assert_eq!(endpoint.address(), "*");
    assert!(!endpoint.is_ssl_enabled());
    assert_eq!(framework.get_listening_port("chain1").unwrap(), 11551);
    assert_eq!(
        fixture.listener.events_for("chain1"),
        [ChainEvent::Initialized, ChainEvent::Started]
    );
    assert_eq!(fixture.journal.hooks_for("tcp"), ["init", "start"]);
}

#[test]
fn quiesce_completes_after_timeout() {
    let fixture = single_chain();
    let framework = &fixture.framework;
    framework.start_chain("chain1").expect("start");
    fixture.listener.clear();

    framework.stop_chain("chain1", 5000).expect("stop");
    assert_eq!(framework.get_chain_state("chain1").unwrap(), RuntimeState::Quiesced);
    assert_eq!(fixture.listener.events_for("chain1"), [ChainEvent::Quiesced]);
    assert_eq!(
        fixture.journal.stop_timeouts("tcp"),
        [Duration::from_millis(5000)]
    );

    assert_eq!(fixture.timer.advance(Duration::from_millis(4999)), 0);
    assert_eq!(framework.get_chain_state("chain1").unwrap(), RuntimeState::Quiesced);

    assert_eq!(fixture.timer.advance(Duration::from_millis(1)), 1);
    assert_eq!(framework.get_chain_state("chain1").unwrap(), RuntimeState::Initialized);
    assert_eq!(
        fixture.listener.events_for("chain1"),
        [ChainEvent::Quiesced, ChainEvent::Stopped]
    );
    assert_eq!(
        fixture.journal.stop_timeouts("tcp"),
        [Duration::from_millis(5000), Duration::ZERO]
    );
}

#[test]
fn zero_timeout_stop_cancels_pending_quiesce() {
    let fixture = single_chain();
    let framework = &fixture.framework;
    framework.start_chain("chain1").expect("start");
    framework.stop_chain("chain1", 5000).expect("quiesce");
    assert_eq!(fixture.timer.pending(), 1);

    framework.stop_chain("chain1", 0).expect("stop now");
    assert_eq!(framework.get_chain_state("chain1").unwrap(), RuntimeState::Initialized);
    assert_eq!(fixture.timer.pending(), 0);
    assert_eq!(fixture.timer.advance(Duration::from_secs(10)), 0);
    assert_eq!(fixture.listener.count(ChainEvent::Stopped), 1);
}

#[test]
fn restart_after_quiesce_ignores_stale_timer() {
    let fixture = single_chain();
    let framework = &fixture.framework;
    framework.start_chain("chain1").expect("start");
    framework.stop_chain("chain1", 100).expect("quiesce");
    framework.complete_quiesce("chain1").expect("drain");
    framework.start_chain("chain1").expect("restart");

    fixture.timer.advance(Duration::from_millis(200));
    assert_eq!(framework.get_chain_state("chain1").unwrap(), RuntimeState::Started);
}

#[test]
fn start_from_quiesced_is_rejected() {
    let fixture = single_chain();
    let framework = &fixture.framework;
    framework.start_chain("chain1").expect("start");
    framework.stop_chain("chain1", 1000).expect("quiesce");

    let err = framework.start_chain("chain1").expect_err("quiesced");
    assert!(matches!(err, FrameworkError::InvalidRuntimeState { .. }));
}

#[test]
fn negative_timeout_is_invalid_and_unknown_chain_stop_is_noop() {
    let fixture = single_chain();
    let framework = &fixture.framework;
    let err = framework.stop_chain("chain1", -1).expect_err("negative");
    assert!(matches!(err, FrameworkError::InvalidTimer { millis: -1, .. }));
    framework.stop_chain("missing", 0).expect("unknown chain stop is a no-op");
    framework.stop_chain("chain1", 0).expect("uninitialized stop is a no-op");
}

#[test]
fn destroy_requires_stopped_chain_and_runs_in_reverse() {
    let fixture = single_chain();
    let framework = &fixture.framework;
    framework.start_chain("chain1").expect("start");

    let err = framework.destroy_chain("chain1").expect_err("running");
    assert!(matches!(err, FrameworkError::InvalidRuntimeState { .. }));

    framework.stop_chain("chain1", 0).expect("stop");
    fixture.journal.reset();
    framework.destroy_chain("chain1").expect("destroy");

    let destroyed: Vec<String> = fixture
        .journal
        .calls()
        .into_iter()
        .filter(|(_, hook)| *hook == "destroy")
        .map(|(channel, _)| channel)
        .collect();
    assert_eq!(destroyed, ["app", "tcp"]);
    assert_eq!(framework.get_chain_state("chain1").unwrap(), RuntimeState::Uninitialized);
    assert_eq!(framework.num_running_channels(), 0);
    assert_eq!(fixture.journal.destroyed_factories(), 2);
    assert!(!framework.get_channel_factory(TCP).unwrap().is_initialized());
    framework.destroy_chain("chain1").expect("second destroy is a no-op");
}

#[test]
fn init_twice_is_a_state_error() {
    let fixture = single_chain();
    let framework = &fixture.framework;
    framework.init_chain("chain1").expect("init");
    let err = framework.init_chain("chain1").expect_err("already initialized");
    assert!(matches!(err, FrameworkError::InvalidRuntimeState { .. }));
}

#[test]
fn failed_init_is_resumed_without_rollback() {
    let fixture = single_chain();
    let framework = &fixture.framework;
    fixture.journal.fail("app", "init", 1, false);

    let err = framework.start_chain("chain1").expect_err("app init fails");
    assert!(matches!(err, FrameworkError::Channel { hook: "init", .. }));
    assert_eq!(
        fixture.listener.events_for("chain1"),
        [ChainEvent::StartFailed {
            attempts_made: 1,
            attempts_left: 0
        }]
    );
    assert_eq!(framework.get_chain_state("chain1").unwrap(), RuntimeState::Initialized);
    assert_eq!(framework.num_running_channels(), 1);

    framework.start_chain("chain1").expect("resumed start");
    assert_eq!(framework.get_chain_state("chain1").unwrap(), RuntimeState::Started);
    assert_eq!(fixture.journal.count("tcp", "init"), 1);
    assert_eq!(fixture.journal.count("app", "init"), 2);
}

#[test]
fn shared_channel_reports_highest_state() {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[("port", "80")]);
    fixture.channel("app-a", PROTO, &[]);
    fixture.channel("app-b", PROTO, &[]);
    fixture.inbound("a", &["tcp", "app-a"]);
    fixture.inbound("b", &["tcp", "app-b"]);
    let framework = &fixture.framework;

    framework.init_chain("b").expect("init b");
    framework.start_chain("a").expect("start a");
    assert_eq!(framework.get_channel_state("tcp", "b").unwrap(), RuntimeState::Started);
    assert_eq!(fixture.journal.count("tcp", "init"), 1);

    framework.stop_chain("a", 0).expect("stop a");
    framework.destroy_chain("a").expect("destroy a");
    assert_eq!(framework.get_channel_state("tcp", "b").unwrap(), RuntimeState::Initialized);
    assert_eq!(fixture.journal.count("tcp", "destroy"), 0);
    assert_eq!(framework.get_channel_factory(TCP).unwrap().ref_count(), 1);
}

#[test]
fn stopping_one_chain_keeps_shared_channel_for_started_sibling() {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[("port", "80")]);
    fixture.channel("app-a", PROTO, &[]);
    fixture.channel("app-b", PROTO, &[]);
    fixture.inbound("a", &["tcp", "app-a"]);
    fixture.inbound("b", &["tcp", "app-b"]);
    let framework = &fixture.framework;
    framework.start_chain("a").expect("start a");
    framework.start_chain("b").expect("start b");
    assert_eq!(fixture.journal.count("tcp", "start"), 1);

    framework.stop_chain("a", 0).expect("stop a");
    assert_eq!(fixture.journal.count("tcp", "stop"), 0);
    assert_eq!(fixture.journal.count("app-a", "stop"), 1);
    assert_eq!(framework.get_channel_state("tcp", "b").unwrap(), RuntimeState::Started);
    assert_eq!(framework.num_started_chains_using_channel("tcp"), 1);

    let process = framework.discrimination_process("tcp").expect("tcp process");
    assert_eq!(process.discriminators(), [("app-b".to_owned(), 10)]);
}

#[test]
fn disabled_chain_is_not_started() {
    let fixture = single_chain();
    let framework = &fixture.framework;
    framework.set_chain_enabled("chain1", false).expect("disable");
    framework.start_chain("chain1").expect("skipped");
    assert_eq!(framework.get_chain_state("chain1").unwrap(), RuntimeState::Uninitialized);
}

#[test]
fn outbound_chains_reject_direct_lifecycle_calls() {
    let fixture = Fixture::new();
    fixture.channel("out-app", PROTO, &[]);
    fixture.channel("out-tcp", TCP, &[]);
    fixture.outbound("out", &["out-app", "out-tcp"]);
    let framework = &fixture.framework;

    for result in [
        framework.init_chain("out"),
        framework.start_chain("out"),
        framework.stop_chain("out", 0),
        framework.destroy_chain("out"),
    ] {
        assert!(matches!(result, Err(FrameworkError::InvalidChainName { .. })));
    }
    let err = framework.start_chain("missing").expect_err("unknown chain");
    assert!(matches!(err, FrameworkError::InvalidChainName { .. }));
}

#[test]
fn clear_tears_everything_down() {
    let fixture = single_chain();
    let framework = &fixture.framework;
    framework.start_chain("chain1").expect("start");
    framework.add_chain_group("g", &["chain1"]).expect("group");

    framework.clear().expect("clear");
    assert_eq!(framework.num_chains(), 0);
    assert_eq!(framework.num_channels(), 0);
    assert_eq!(framework.num_chain_groups(), 0);
    assert_eq!(framework.num_running_channels(), 0);
    assert_eq!(framework.num_channel_factories(), 0);
    assert_eq!(fixture.journal.destroyed_factories(), 2);
    assert!(framework.lookup_factory(TCP).is_some());
}

#[test]
fn start_rejected_by_state_reports_no_failed_attempt() {
    let fixture = single_chain();
    let framework = &fixture.framework;
    framework.start_chain("chain1").expect("start");
    framework.stop_chain("chain1", 5000).expect("quiesce");
    fixture.listener.clear();

    let err = framework.start_chain("chain1").expect_err("quiesced chain");
    assert!(matches!(
        err,
        FrameworkError::InvalidRuntimeState {
            state: RuntimeState::Quiesced,
            ..
        }
    ));
    assert!(fixture.listener.events_for("chain1").is_empty());
    assert_eq!(fixture.journal.count("app", "start"), 1);
}
