//! 集成测试共用夹具：手动定时器、共享调用记录与已注册的桩工厂。
#![allow(dead_code)]

use std::sync::Arc;

use spark_channelfw::test_stubs::{Journal, RecordingListener, StubFactory};
use spark_channelfw::{ALL_CHAINS, ChainEventListener, ChannelFramework, ManualTimer, PropertyBag};

/// 传输工厂类型名。
pub const TCP: &str = "tcp";
/// 安全传输工厂类型名。
pub const SSL: &str = "ssl";
/// 协议工厂类型名。
pub const PROTO: &str = "proto";

pub struct Fixture {
    pub framework: ChannelFramework,
    pub timer: ManualTimer,
    pub journal: Journal,
    pub listener: Arc<RecordingListener>,
}

impl Fixture {
    /// 以手动定时器构建框架，注册三种桩工厂，并挂上一个全局记录监听器。
    pub fn new() -> Self {
        let timer = ManualTimer::new();
        let framework = ChannelFramework::builder()
            .timer(Arc::new(timer.clone()))
            .build();
        let journal = Journal::default();
        framework
            .register_factory(TCP, StubFactory::transport().with_journal(&journal).constructor())
            .expect("register tcp");
        framework
            .register_factory(
                SSL,
                StubFactory::transport()
                    .secure()
                    .with_journal(&journal)
                    .constructor(),
            )
            .expect("register ssl");
        framework
            .register_factory(PROTO, StubFactory::protocol().with_journal(&journal).constructor())
            .expect("register proto");
        let listener = Arc::new(RecordingListener::default());
        framework
            .add_chain_event_listener(
                Arc::clone(&listener) as Arc<dyn ChainEventListener>,
                ALL_CHAINS,
            )
            .expect("global listener");
        Self {
            framework,
            timer,
            journal,
            listener,
        }
    }

    /// 添加通道，属性以 `(键, 值)` 列表给出。
    pub fn channel(&self, name: &str, factory_type: &str, properties: &[(&str, &str)]) {
        self.framework
            .add_channel(name, factory_type, props(properties), None)
            .expect("add channel");
    }

    /// 添加入站链。
    pub fn inbound(&self, name: &str, channels: &[&str]) {
        self.framework
            .add_chain(name, spark_channelfw::FlowType::Inbound, channels)
            .expect("add chain")
            .expect("chain admitted");
    }

    /// 添加出站链。
    pub fn outbound(&self, name: &str, channels: &[&str]) {
        self.framework
            .add_chain(name, spark_channelfw::FlowType::Outbound, channels)
            .expect("add chain")
            .expect("chain admitted");
    }
}

pub fn props(pairs: &[(&str, &str)]) -> PropertyBag {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
        .collect()
}
