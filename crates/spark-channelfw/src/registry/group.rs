/// 链组配置快照。
///
/// 成员链名唯一且保持加入顺序；一条链可以同时属于多个链组。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainGroupConfig {
    name: String,
    chains: Vec<String>,
}

impl ChainGroupConfig {
    pub(crate) fn new(name: &str, chains: &[String]) -> Self {
        let mut group = Self {
            name: name.to_owned(),
            chains: Vec::with_capacity(chains.len()),
        };
        for chain in chains {
            group.insert(chain);
        }
        group
    }

    /// 链组名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 成员链名。
    pub fn chains(&self) -> &[String] {
        &self.chains
    }

    /// 是否包含指定链。
    pub fn contains(&self, chain: &str) -> bool {
        self.chains.iter().any(|name| name == chain)
    }

    /// 加入成员；已存在时返回 `false`。
    pub(crate) fn insert(&mut self, chain: &str) -> bool {
        if self.contains(chain) {
            return false;
        }
        self.chains.push(chain.to_owned());
        true
    }

    /// 移除成员；不存在时返回 `false`。
    pub(crate) fn remove(&mut self, chain: &str) -> bool {
        let before = self.chains.len();
        self.chains.retain(|name| name != chain);
        before != self.chains.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_is_unique_and_ordered() {
        let group = ChainGroupConfig::new(
            "web",
            &["b".to_owned(), "a".to_owned(), "b".to_owned()],
        );
        assert_eq!(group.chains(), ["b".to_owned(), "a".to_owned()]);
    }
}
