use std::collections::{BTreeMap, BTreeSet};

use crate::id::{MemberId, MessageId};

/// The committed configurations of the club, ordered by the id of the fuse
/// that installed each one. Never empty: a hub is born with the singleton
/// configuration containing only itself, keyed at logical time zero.
#[derive(Debug)]
pub struct ConfigStore {
    configs: BTreeMap<MessageId, BTreeSet<MemberId>>,
}

impl ConfigStore {
    pub fn new(self_id: MemberId) -> Self {
        let mut configs = BTreeMap::new();
        configs.insert(MessageId::new(0, self_id), BTreeSet::from([self_id]));
        ConfigStore { configs }
    }

    /// Id of the configuration currently in force.
    pub fn current_id(&self) -> MessageId {
        *self.configs.keys().next_back().expect("config store is never empty")
    }

    /// Member set of the configuration currently in force.
    pub fn current_members(&self) -> &BTreeSet<MemberId> {
        self.configs
            .values()
            .next_back()
            .expect("config store is never empty")
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.configs.contains_key(id)
    }

    /// Record a newly committed configuration.
    pub fn install(&mut self, id: MessageId, members: BTreeSet<MemberId>) {
        self.configs.insert(id, members);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(n: u128) -> MemberId {
        MemberId::from_bytes(n.to_be_bytes())
    }

    #[test]
    fn starts_with_the_singleton_configuration() {
        let store = ConfigStore::new(member(1));
        assert_eq!(store.configs.len(), 1);
        assert_eq!(store.current_id(), MessageId::new(0, member(1)));
        assert_eq!(store.current_members(), &BTreeSet::from([member(1)]));
    }

    #[test]
    fn install_moves_the_current_configuration_forward() {
        let mut store = ConfigStore::new(member(1));
        let fuse_id = MessageId::new(4, member(2));
        store.install(fuse_id, BTreeSet::from([member(1), member(2)]));

        assert_eq!(store.current_id(), fuse_id);
        assert_eq!(
            store.current_members(),
            &BTreeSet::from([member(1), member(2)])
        );
        assert!(store.contains(&MessageId::new(0, member(1))));
        assert!(!store.contains(&MessageId::new(4, member(3))));
    }
}
