//! 甄别集成测试：投票协议、写时复制替换流程，以及共享传输通道上的甄别器装配。

mod support;

use std::sync::Arc;

use bytes::Bytes;
use spark_channelfw::test_stubs::StubDiscriminator;
use spark_channelfw::{
    DeviceLink, DiscriminationProcess, DiscriminationStatus, TypeToken, VirtualConnection, Vote,
};
use support::{Fixture, PROTO, TCP};

fn request() -> Bytes {
    Bytes::from_static(b"GET / HTTP/1.1\r\n")
}

#[test]
fn maybe_then_yes_after_process_swap() {
    let maybe_a = Arc::new(StubDiscriminator::fixed("maybe-a", Vote::Maybe));
    let maybe_b = Arc::new(StubDiscriminator::fixed("maybe-b", Vote::Maybe));
    let no_a = Arc::new(StubDiscriminator::fixed("no-a", Vote::No));
    let no_b = Arc::new(StubDiscriminator::fixed("no-b", Vote::No));

    let mut process = DiscriminationProcess::new(TypeToken::of::<Bytes>());
    process.add(maybe_a.clone(), 40).expect("add");
    process.add(no_a.clone(), 30).expect("add");
    process.add(maybe_b.clone(), 20).expect("add");
    process.add(no_b.clone(), 10).expect("add");
    process.start();

    let vc = VirtualConnection::detached(1);
    let mut link = DeviceLink::new();
    let data = request();
    assert_eq!(
        process.discriminate(&vc, Some(&data), &mut link),
        DiscriminationStatus::Again
    );
    assert!(vc.has_discrimination_state());

    let mut next = process.unstarted_copy();
    next.add(Arc::new(StubDiscriminator::fixed("yes", Vote::Yes)), 5)
        .expect("add to copy");
    next.start();

    assert_eq!(
        next.discriminate(&vc, Some(&data), &mut link),
        DiscriminationStatus::Success
    );
    assert_eq!(link.application_link().expect("bound").channel_name(), "yes");
    assert!(!vc.has_discrimination_state());
    // NO 票在两次调用之间被记住，不会再次询问。
    assert_eq!(no_a.calls(), 1);
    assert_eq!(no_b.calls(), 1);
    assert_eq!(maybe_a.calls(), 2);

    let fresh = VirtualConnection::detached(2);
    let mut fresh_link = DeviceLink::new();
    assert_eq!(
        next.discriminate(&fresh, Some(&data), &mut fresh_link),
        DiscriminationStatus::Success
    );
    assert_eq!(no_a.calls(), 2);
    assert_eq!(process.len(), 4);
}

#[test]
fn equal_weights_keep_insertion_order() {
    let mut process = DiscriminationProcess::new(TypeToken::of::<Bytes>());
    for name in ["first", "second", "third"] {
        process
            .add(Arc::new(StubDiscriminator::fixed(name, Vote::Yes)), 10)
            .expect("add");
    }
    process
        .add(Arc::new(StubDiscriminator::fixed("first", Vote::Yes)), 10)
        .expect("replace keeps one entry");
    let order: Vec<String> = process
        .discriminators()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(order, ["second", "third", "first"]);
}

fn shared_transport() -> Fixture {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[("port", "9080")]);
    fixture.channel("http", PROTO, &[("vote", "maybe")]);
    fixture.channel("sip", PROTO, &[("vote", "no")]);
    fixture.channel("iiop", PROTO, &[("vote", "yes")]);
    fixture.inbound("http-chain", &["tcp", "http"]);
    fixture.inbound("sip-chain", &["tcp", "sip"]);
    fixture.inbound("iiop-chain", &["tcp", "iiop"]);
    fixture
}

#[test]
fn shared_transport_collects_discriminators_from_every_started_chain() {
    let fixture = shared_transport();
    let framework = &fixture.framework;
    framework.start_chain("http-chain").expect("start http");
    framework.start_chain("sip-chain").expect("start sip");

    let handle = framework.discrimination_handle("tcp").expect("tcp process");
    assert_eq!(
        handle.load().discriminators(),
        [("http".to_owned(), 10), ("sip".to_owned(), 10)]
    );
    assert!(handle.load().is_started());
    assert!(framework.discrimination_process("http").expect("http process").is_empty());

    let vc = framework.get_inbound_vc_factory().create_connection();
    let mut link = DeviceLink::new();
    let data = request();
    assert_eq!(
        handle.load().discriminate(&vc, Some(&data), &mut link),
        DiscriminationStatus::Again
    );

    framework.start_chain("iiop-chain").expect("start iiop");
    assert_eq!(
        handle.load().discriminate(&vc, Some(&data), &mut link),
        DiscriminationStatus::Success
    );
    assert_eq!(link.application_link().expect("bound").channel_name(), "iiop");
    assert!(fixture.journal.process_updates("tcp") >= 3);
}

#[test]
fn weight_update_reorders_running_process() {
    let fixture = shared_transport();
    let framework = &fixture.framework;
    framework.start_chain("http-chain").expect("start http");
    framework.start_chain("iiop-chain").expect("start iiop");

    framework.update_channel_weight("iiop", 50).expect("weight");
    let process = framework.discrimination_process("tcp").expect("process");
    assert_eq!(
        process.discriminators(),
        [("iiop".to_owned(), 50), ("http".to_owned(), 10)]
    );

    let vc = framework.get_inbound_vc_factory().create_connection();
    let mut link = DeviceLink::new();
    let data = request();
    assert_eq!(
        process.discriminate(&vc, Some(&data), &mut link),
        DiscriminationStatus::Success
    );
    assert!(!vc.has_discrimination_state());
}

#[test]
fn stopped_chain_withdraws_its_discriminator() {
    let fixture = shared_transport();
    let framework = &fixture.framework;
    framework.start_chain("http-chain").expect("start http");
    framework.start_chain("iiop-chain").expect("start iiop");
    let before = framework.discrimination_process("tcp").expect("process");

    framework.stop_chain("iiop-chain", 0).expect("stop");
    let after = framework.discrimination_process("tcp").expect("process");
    assert_eq!(after.discriminators(), [("http".to_owned(), 10)]);
    // 旧快照仍可供正在甄别的连接使用。
    assert_eq!(before.len(), 2);
}

#[test]
fn shared_upper_channel_is_withdrawn_per_transport() {
    let fixture = Fixture::new();
    fixture.channel("tcp1", TCP, &[("port", "8001")]);
    fixture.channel("tcp2", TCP, &[("port", "8002")]);
    fixture.channel("http", PROTO, &[]);
    fixture.channel("ftp", PROTO, &[]);
    fixture.inbound("c1", &["tcp1", "http"]);
    fixture.inbound("c2", &["tcp2", "http"]);
    fixture.inbound("c3", &["tcp2", "ftp"]);
    let framework = &fixture.framework;
    for chain in ["c1", "c2", "c3"] {
        framework.start_chain(chain).expect("start");
    }
    let names = |channel: &str| -> Vec<String> {
        framework
            .discrimination_process(channel)
            .expect("process")
            .discriminators()
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    };
    assert_eq!(names("tcp2"), ["http", "ftp"]);

    framework.stop_chain("c2", 0).expect("stop");
    assert_eq!(names("tcp2"), ["ftp"]);
    assert_eq!(names("tcp1"), ["http"]);
    assert!(framework.is_chain_running("c1"));

    framework.destroy_chain("c2").expect("destroy");
    assert_eq!(names("tcp2"), ["ftp"]);

    let vc = framework.get_inbound_vc_factory().create_connection();
    let mut link = DeviceLink::new();
    let process = framework.discrimination_process("tcp2").expect("process");
    assert_eq!(
        process.discriminate(&vc, Some(&request()), &mut link),
        DiscriminationStatus::Success
    );
    assert_eq!(link.application_link().expect("bound").channel_name(), "ftp");

    // 重新挂载的甄别器排在同权重的既有甄别器之后。
    framework.start_chain("c2").expect("restart");
    assert_eq!(names("tcp2"), ["ftp", "http"]);
}
