//! 配置注册表集成测试：通道、链与工厂类型的增删改查及其校验。

mod support;

use std::sync::Arc;

use spark_channelfw::{
    ChainAdmissionPolicy, ChainEvent, ChainFilter, ChannelFramework, DEFAULT_DISC_WEIGHT,
    ErrorCategory, FactoryDescriptor, FlowType, FrameworkError, ManualTimer, RuntimeState,
};
use spark_channelfw::test_stubs::StubFactory;
use support::{Fixture, PROTO, SSL, TCP, props};

#[test]
fn add_channel_validates_inputs() {
    let fixture = Fixture::new();
    let framework = &fixture.framework;

    let config = framework
        .add_channel("tcp", TCP, props(&[("port", "80")]), None)
        .expect("add");
    assert_eq!(config.weight(), DEFAULT_DISC_WEIGHT);
    assert_eq!(config.property("port"), Some("80"));

    let duplicate = framework.add_channel("tcp", TCP, props(&[]), None);
    assert!(matches!(duplicate, Err(FrameworkError::DuplicateChannelName { .. })));

    let unknown = framework.add_channel("x", "nope", props(&[]), None);
    assert!(matches!(unknown, Err(FrameworkError::InvalidFactory { .. })));

    let empty = framework.add_channel("y", "", props(&[]), None);
    assert!(matches!(empty, Err(FrameworkError::InvalidFactory { .. })));

    let negative = framework.add_channel("z", TCP, props(&[]), Some(-1));
    assert!(matches!(negative, Err(FrameworkError::InvalidWeight { weight: -1, .. })));

    assert_eq!(framework.num_channels(), 1);
    let factory = framework.get_channel_factory(TCP).expect("factory entry created lazily");
    assert!(!factory.is_initialized());
    assert_eq!(factory.ref_count(), 0);
}

#[test]
fn add_chain_validates_channels_and_coherency() {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[]);
    fixture.channel("app", PROTO, &[]);
    let framework = &fixture.framework;

    let empty = framework.add_chain("c", FlowType::Inbound, &[]);
    assert!(matches!(empty, Err(FrameworkError::InvalidChannelName { .. })));

    let unknown = framework.add_chain("c", FlowType::Inbound, &["tcp", "ghost"]);
    assert!(matches!(unknown, Err(FrameworkError::InvalidChannelName { .. })));

    let backwards = framework.add_chain("c", FlowType::Inbound, &["app", "tcp"]);
    let err = backwards.expect_err("protocol cannot face the device");
    assert_eq!(err.category(), ErrorCategory::Coherency);

    framework
        .add_chain("c", FlowType::Inbound, &["tcp", "app"])
        .expect("coherent")
        .expect("admitted");
    let duplicate = framework.add_chain("c", FlowType::Inbound, &["tcp", "app"]);
    assert!(matches!(duplicate, Err(FrameworkError::DuplicateChainName { .. })));

    let reserved = framework.add_chain("*", FlowType::Inbound, &["tcp", "app"]);
    assert!(matches!(reserved, Err(FrameworkError::InvalidChainName { .. })));
    assert_eq!(framework.num_chains(), 1);
}

#[test]
fn remove_channel_cascades_to_idle_chains_only() {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[]);
    fixture.channel("app", PROTO, &[]);
    fixture.inbound("c", &["tcp", "app"]);
    let framework = &fixture.framework;
    framework.add_chain_group("g", &["c"]).expect("group");

    framework.init_chain("c").expect("init");
    let err = framework.remove_channel("app").expect_err("in use");
    assert!(matches!(err, FrameworkError::ChannelInUse { .. }));
    assert_eq!(err.category(), ErrorCategory::Resource);

    framework.destroy_chain("c").expect("destroy");
    framework.remove_channel("app").expect("remove");
    assert!(framework.get_chain("c").is_none());
    assert!(framework.get_chain_group("g").unwrap().chains().is_empty());
    assert!(framework.get_channel("tcp").is_some());
}

#[test]
fn remove_chain_requires_uninitialized_state() {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[]);
    fixture.channel("app", PROTO, &[]);
    fixture.inbound("c", &["tcp", "app"]);
    let framework = &fixture.framework;
    framework.add_chain_group("g", &["c"]).expect("group");

    framework.init_chain("c").expect("init");
    let err = framework.remove_chain("c").expect_err("initialized");
    assert!(matches!(
        err,
        FrameworkError::ChainInUse {
            state: RuntimeState::Initialized,
            ..
        }
    ));

    framework.destroy_chain("c").expect("destroy");
    framework.remove_chain("c").expect("remove");
    assert_eq!(framework.num_groups_using_chain("c"), 0);
}

#[test]
fn update_chain_revalidates_and_notifies() {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[]);
    fixture.channel("tls", SSL, &[]);
    fixture.channel("app", PROTO, &[]);
    fixture.inbound("c", &["tcp", "app"]);
    let framework = &fixture.framework;

    let incoherent = framework.update_chain("c", &["app"]);
    assert!(incoherent.is_err());

    let updated = framework.update_chain("c", &["tls", "app"]).expect("update");
    assert_eq!(updated.channels(), ["tls", "app"]);
    assert_eq!(fixture.listener.events_for("c"), [ChainEvent::Updated]);
    assert!(framework.get_end_point("c").is_err());

    framework.start_chain("c").expect("start");
    let err = framework.update_chain("c", &["tcp", "app"]).expect_err("running");
    assert!(matches!(err, FrameworkError::ChainRunning { .. }));
}

#[test]
fn channel_updates_reach_running_instances() {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[("port", "80")]);
    fixture.channel("app", PROTO, &[]);
    fixture.inbound("c", &["tcp", "app"]);
    let framework = &fixture.framework;
    framework.start_chain("c").expect("start");

    framework
        .update_channel_property("tcp", "listeningPort", "8080")
        .expect("update property");
    let pushed = fixture.journal.last_config("tcp").expect("pushed to running channel");
    assert_eq!(pushed.property("listeningPort"), Some("8080"));
    assert_eq!(framework.get_listening_port("c").unwrap(), 8080);

    framework.update_channel_weight("app", 42).expect("weight");
    let process = framework.discrimination_process("tcp").expect("process");
    assert_eq!(process.discriminators(), [("app".to_owned(), 42)]);
    assert!(process.is_started());

    let err = framework.update_channel_weight("app", -5).expect_err("negative");
    assert!(matches!(err, FrameworkError::InvalidWeight { .. }));
    assert_eq!(framework.get_channel("app").unwrap().weight(), 42);

    framework
        .update_all_channel_properties("tcp", props(&[("port", "81")]))
        .expect("replace");
    assert_eq!(framework.get_listening_port("c").unwrap(), 81);
    assert!(framework.update_channel_property("ghost", "a", "b").is_err());
}

#[test]
fn chain_queries_filter_by_channel_and_factory() {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[]);
    fixture.channel("tls", SSL, &[("port", "443")]);
    fixture.channel("app", PROTO, &[]);
    fixture.inbound("plain", &["tcp", "app"]);
    fixture.inbound("secure", &["tls", "app"]);
    let framework = &fixture.framework;
    framework.start_chain("secure").expect("start");

    let names = |chains: Vec<spark_channelfw::ChainConfig>| -> Vec<String> {
        chains.iter().map(|chain| chain.name().to_owned()).collect()
    };
    assert_eq!(names(framework.get_all_chains(ChainFilter::All).unwrap()), ["plain", "secure"]);
    assert_eq!(
        names(framework.get_all_chains(ChainFilter::Channel("tcp")).unwrap()),
        ["plain"]
    );
    assert_eq!(
        names(framework.get_all_chains(ChainFilter::FactoryType(PROTO)).unwrap()),
        ["plain", "secure"]
    );
    assert_eq!(
        names(framework.get_running_chains(ChainFilter::All).unwrap()),
        ["secure"]
    );
    assert!(framework.get_all_chains(ChainFilter::Channel("ghost")).is_err());

    let running: Vec<String> = framework
        .get_running_channels()
        .iter()
        .map(|channel| channel.name().to_owned())
        .collect();
    assert_eq!(running, ["app", "tls"]);
    assert!(framework.get_end_point("secure").unwrap().is_ssl_enabled());
}

struct DenyPrefix(&'static str);

impl ChainAdmissionPolicy for DenyPrefix {
    fn admit(&self, chain: &str, _: FlowType, _: &[String], _: &[&FactoryDescriptor]) -> bool {
        !chain.starts_with(self.0)
    }
}

#[test]
fn admission_policy_silently_rejects() {
    let framework = ChannelFramework::builder()
        .timer(Arc::new(ManualTimer::new()))
        .admission_policy(Arc::new(DenyPrefix("restricted")))
        .build();
    framework
        .register_factory(TCP, StubFactory::transport().constructor())
        .expect("register");
    framework
        .add_channel("tcp", TCP, props(&[]), None)
        .expect("channel");

    let rejected = framework
        .add_chain("restricted-1", FlowType::Inbound, &["tcp"])
        .expect("no error");
    assert!(rejected.is_none());
    assert!(framework.get_chain("restricted-1").is_none());
    assert!(
        framework
            .add_chain("open", FlowType::Inbound, &["tcp"])
            .expect("no error")
            .is_some()
    );
}

#[test]
fn factory_properties_reach_the_singleton() {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[("port", "80")]);
    fixture.channel("app", PROTO, &[]);
    fixture.inbound("c", &["tcp", "app"]);
    let framework = &fixture.framework;

    let data = framework
        .update_channel_factory_property(TCP, "backlog", "128")
        .expect("factory property");
    assert_eq!(data.properties().get("backlog").map(String::as_str), Some("128"));
    assert!(fixture.journal.factory_updates().is_empty());

    framework.start_chain("c").expect("start");
    assert!(
        fixture
            .journal
            .factory_inits()
            .iter()
            .any(|props| props.get("backlog").map(String::as_str) == Some("128"))
    );
    framework
        .update_all_channel_factory_properties(TCP, props(&[("backlog", "256")]))
        .expect("replace");
    assert_eq!(fixture.journal.factory_updates().len(), 1);
    assert_eq!(framework.get_channel_factory(TCP).unwrap().ref_count(), 1);
    assert!(framework.update_channel_factory_property("nope", "a", "b").is_err());
}

#[test]
fn deregister_factory_removes_dependent_configuration() {
    let fixture = Fixture::new();
    fixture.channel("tcp", TCP, &[]);
    fixture.channel("tls", SSL, &[]);
    fixture.channel("app", PROTO, &[]);
    fixture.inbound("plain", &["tcp", "app"]);
    fixture.inbound("secure", &["tls", "app"]);
    let framework = &fixture.framework;
    framework.start_chain("plain").expect("start");

    framework.deregister_factory(TCP).expect("deregister");
    assert!(framework.lookup_factory(TCP).is_none());
    assert!(framework.get_channel("tcp").is_none());
    assert!(framework.get_chain("plain").is_none());
    assert!(framework.get_chain("secure").is_some());
    assert_eq!(framework.num_running_chains(), 0);
    assert_eq!(fixture.journal.count("tcp", "destroy"), 1);

    let again = framework.deregister_factory(TCP);
    assert!(matches!(again, Err(FrameworkError::InvalidFactory { .. })));
}
