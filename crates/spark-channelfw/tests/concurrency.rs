//! 并发集成测试：多线程争用同一条链的生命周期，以及并发甄别共享同一甄别流程。

mod support;

use std::sync::{Arc, Barrier};
use std::thread;

use arc_swap::ArcSwap;
use bytes::Bytes;
use spark_channelfw::test_stubs::StubDiscriminator;
use spark_channelfw::{
    ChainEvent, DeviceLink, DiscriminationHandle, DiscriminationProcess, DiscriminationStatus,
    RuntimeState, TypeToken, VirtualConnection, Vote,
};
use support::{Fixture, PROTO, TCP};

const THREADS: usize = 8;
const ROUNDS: usize = 25;

fn shared_chain() -> Fixture {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[("port", "12080")]);
    fixture.channel("app", PROTO, &[]);
    fixture.inbound("chain1", &["tcp", "app"]);
    fixture
}

#[test]
fn racing_start_and_stop_initializes_each_channel_once() {
    let fixture = shared_chain();
    let framework = &fixture.framework;
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..ROUNDS {
                    framework.start_chain("chain1").expect("start");
                    framework.stop_chain("chain1", 0).expect("stop");
                }
            });
        }
    });

    framework.start_chain("chain1").expect("final start");
    assert_eq!(framework.get_chain_state("chain1").unwrap(), RuntimeState::Started);
    for channel in ["tcp", "app"] {
        assert_eq!(fixture.journal.count(channel, "init"), 1, "{channel} init");
        assert_eq!(
            fixture.journal.count(channel, "start"),
            fixture.journal.count(channel, "stop") + 1,
            "{channel} start/stop pairing"
        );
    }
    assert_eq!(
        fixture.listener.count(ChainEvent::Started),
        fixture.listener.count(ChainEvent::Stopped) + 1
    );
    assert_eq!(fixture.listener.count(ChainEvent::Initialized), 1);
    for factory in [TCP, PROTO] {
        let data = framework.get_channel_factory(factory).expect("factory entry");
        assert_eq!(data.ref_count(), 1, "{factory} references");
    }
    assert_eq!(framework.num_running_channels(), 2);

    framework.stop_chain("chain1", 0).expect("stop");
    framework.destroy_chain("chain1").expect("destroy");
    for factory in [TCP, PROTO] {
        let data = framework.get_channel_factory(factory).expect("factory entry");
        assert_eq!(data.ref_count(), 0, "{factory} references");
    }
    assert_eq!(framework.num_running_channels(), 0);
    assert_eq!(fixture.journal.count("tcp", "destroy"), 1);
}

#[test]
fn concurrent_starts_start_the_chain_once() {
    let fixture = shared_chain();
    let framework = &fixture.framework;
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                barrier.wait();
                framework.start_chain("chain1").expect("start");
            });
        }
    });

    for channel in ["tcp", "app"] {
        assert_eq!(fixture.journal.count(channel, "init"), 1);
        assert_eq!(fixture.journal.count(channel, "start"), 1);
    }
    assert_eq!(fixture.listener.events_for("chain1"), [ChainEvent::Initialized, ChainEvent::Started]);
    assert_eq!(framework.get_channel_factory(TCP).expect("tcp").ref_count(), 1);
}

fn process(discriminators: &[(&Arc<StubDiscriminator>, i32)]) -> Arc<DiscriminationProcess> {
    let mut process = DiscriminationProcess::new(TypeToken::of::<Bytes>());
    for (discriminator, weight) in discriminators {
        let discriminator: Arc<StubDiscriminator> = Arc::clone(discriminator);
        process.add(discriminator, *weight).expect("add discriminator");
    }
    Arc::new(process)
}

#[test]
fn distinct_connections_discriminate_concurrently_on_one_handle() {
    let undecided = Arc::new(StubDiscriminator::fixed("sniff", Vote::Maybe));
    let refused = Arc::new(StubDiscriminator::fixed("legacy", Vote::No));
    let http = Arc::new(StubDiscriminator::fixed("http", Vote::Yes));
    let ftp = Arc::new(StubDiscriminator::fixed("ftp", Vote::Yes));
    let with_http = process(&[(&undecided, 30), (&refused, 20), (&http, 10)]);
    let with_ftp = process(&[(&undecided, 30), (&refused, 20), (&ftp, 10)]);
    let handle: DiscriminationHandle = Arc::new(ArcSwap::new(Arc::clone(&with_http)));
    let barrier = Barrier::new(THREADS + 1);

    thread::scope(|scope| {
        for worker in 0..THREADS {
            let (handle, barrier) = (&handle, &barrier);
            scope.spawn(move || {
                barrier.wait();
                let data = Bytes::from_static(b"GET / HTTP/1.1\r\n");
                for round in 0..ROUNDS {
                    let vc = VirtualConnection::detached((worker * ROUNDS + round) as u64);
                    let mut link = DeviceLink::new();
                    let status = handle.load().discriminate(&vc, Some(&data), &mut link);
                    assert_eq!(status, DiscriminationStatus::Success);
                    let chosen = link.application_link().expect("link bound");
                    assert!(matches!(chosen.channel_name(), "http" | "ftp"));
                    assert!(!vc.has_discrimination_state());
                }
            });
        }
        // 读者运行期间整体替换流程，读者要么看到旧流程要么看到新流程。
        barrier.wait();
        for round in 0..ROUNDS {
            let next = if round % 2 == 0 { &with_ftp } else { &with_http };
            handle.store(Arc::clone(next));
        }
    });

    let total = THREADS * ROUNDS;
    assert_eq!(undecided.calls(), total);
    assert_eq!(refused.calls(), total);
    assert_eq!(http.calls() + ftp.calls(), total);
}

#[test]
fn undecided_votes_stay_on_their_own_connection() {
    let undecided = Arc::new(StubDiscriminator::fixed("sniff", Vote::Maybe));
    let refused = Arc::new(StubDiscriminator::fixed("legacy", Vote::No));
    let handle: DiscriminationHandle =
        Arc::new(ArcSwap::new(process(&[(&undecided, 20), (&refused, 10)])));

    thread::scope(|scope| {
        for worker in 0..THREADS {
            let handle = &handle;
            scope.spawn(move || {
                let vc = VirtualConnection::detached(worker as u64);
                let data = Bytes::from_static(b"partial");
                let mut link = DeviceLink::new();
                let current = handle.load();
                assert_eq!(
                    current.discriminate(&vc, Some(&data), &mut link),
                    DiscriminationStatus::Again
                );
                assert!(vc.has_discrimination_state());
                // 第二轮只询问此前投 MAYBE 的甄别器。
                assert_eq!(
                    current.discriminate(&vc, Some(&data), &mut link),
                    DiscriminationStatus::Again
                );
                assert!(link.application_link().is_none());
            });
        }
    });

    assert_eq!(undecided.calls(), THREADS * 2);
    assert_eq!(refused.calls(), THREADS);
}
