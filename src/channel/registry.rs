use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::{Channel, ChannelId};
use crate::error::{EngineError, Result};

/// Subscribed channels keyed by (send id, receive id, namespace)
#[derive(Default)]
pub struct Registry {
    channels: Mutex<HashMap<ChannelId, Arc<Channel>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, Arc<Channel>>> {
        self.channels.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a channel, opening it with `open` only if the id is free
    pub fn subscribe<F>(&self, id: ChannelId, open: F) -> Result<Arc<Channel>>
    where
        F: FnOnce(ChannelId) -> Result<Channel>,
    {
        let mut channels = self.lock();
        if channels.contains_key(&id) {
            return Err(EngineError::ChannelExists { channel: id });
        }
        let channel = Arc::new(open(id.clone())?);
        channels.insert(id, channel.clone());
        Ok(channel)
    }

    pub fn unsubscribe(&self, id: &ChannelId) -> Result<()> {
        let channel = self
            .lock()
            .remove(id)
            .ok_or_else(|| EngineError::UnknownChannel {
                channel: id.clone(),
            })?;
        channel.close()
    }

    pub fn get(&self, id: &ChannelId) -> Result<Arc<Channel>> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownChannel {
                channel: id.clone(),
            })
    }

    pub fn ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.lock().keys().cloned().collect();
        ids.sort_by(|a, b| {
            (a.namespace.as_str(), a.send_id, a.receive_id)
                .cmp(&(b.namespace.as_str(), b.send_id, b.receive_id))
        });
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close and forget every channel. Every channel is closed even if some
    /// fail; the failures are returned.
    pub fn clear(&self) -> Vec<EngineError> {
        let drained: Vec<Arc<Channel>> = self.lock().drain().map(|(_, c)| c).collect();
        drained
            .into_iter()
            .filter_map(|channel| channel.close().err())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::virtual_bus::VirtualBus;
    use crate::bus::BusWriter;
    use crate::channel::ChannelSettings;
    use crate::trace::Tracer;

    fn opener(bus: &Arc<VirtualBus>) -> impl Fn(ChannelId) -> Result<Channel> + '_ {
        move |id| {
            Channel::open(
                id,
                BusWriter::new(bus.clone()),
                ChannelSettings::default(),
                Tracer::new(),
            )
        }
    }

    #[test]
    fn test_subscribe_and_get() {
        let bus = Arc::new(VirtualBus::new());
        let registry = Registry::new();
        let id = ChannelId::new(0x7B3, 0x7BB, "body");
        let channel = registry.subscribe(id.clone(), opener(&bus)).unwrap();
        assert_eq!(channel.id(), &id);
        assert!(Arc::ptr_eq(&registry.get(&id).unwrap(), &channel));
        assert_eq!(registry.len(), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_duplicate_subscribe_rejected_without_side_effects() {
        let bus = Arc::new(VirtualBus::new());
        let registry = Registry::new();
        let id = ChannelId::new(0x7B3, 0x7BB, "body");
        registry.subscribe(id.clone(), opener(&bus)).unwrap();
        let Err(err) = registry.subscribe(id.clone(), opener(&bus)) else {
            panic!("duplicate subscribe accepted");
        };
        assert_eq!(err, EngineError::ChannelExists { channel: id });
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_same_ids_other_namespace_are_distinct() {
        let bus = Arc::new(VirtualBus::new());
        let registry = Registry::new();
        registry
            .subscribe(ChannelId::new(0x7B3, 0x7BB, "body"), opener(&bus))
            .unwrap();
        registry
            .subscribe(ChannelId::new(0x7B3, 0x7BB, "chassis"), opener(&bus))
            .unwrap();
        let ids = registry.ids();
        assert_eq!(ids[0].namespace, "body");
        assert_eq!(ids[1].namespace, "chassis");
    }

    #[test]
    fn test_unsubscribe() {
        let bus = Arc::new(VirtualBus::new());
        let registry = Registry::new();
        let id = ChannelId::new(0x7B3, 0x7BB, "body");
        let channel = registry.subscribe(id.clone(), opener(&bus)).unwrap();
        registry.unsubscribe(&id).unwrap();
        assert!(!channel.is_open());
        assert!(registry.is_empty());
        assert_eq!(bus.subscriber_count(), 0);
        assert!(matches!(
            registry.unsubscribe(&id),
            Err(EngineError::UnknownChannel { .. })
        ));
        assert!(registry.get(&id).is_err());
    }

    #[test]
    fn test_clear_closes_everything() {
        let bus = Arc::new(VirtualBus::new());
        let registry = Registry::new();
        for n in 0..3u32 {
            registry
                .subscribe(ChannelId::new(0x700 + n, 0x708 + n, "body"), opener(&bus))
                .unwrap();
        }
        assert_eq!(bus.subscriber_count(), 3);
        assert!(registry.clear().is_empty());
        assert!(registry.is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
