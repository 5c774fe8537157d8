use crate::dcc::transfer::CancelHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// How often the garbage collector looks for abandoned transfers.
pub const GC_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// A transfer nobody is listening to gets this long before the GC kills it.
pub const STALE_AFTER: Duration = Duration::from_secs(60 * 60);
/// Delay between a terminal event and registry removal, so the final API
/// envelope can flush first.
pub const REMOVE_GRACE: Duration = Duration::from_millis(200);

/// One live transfer as the rest of the process sees it.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub pack_number: String,
    pub send_progress: bool,
    pub started_at: Instant,
    /// Identity of the owning API connection; `None` once that client is
    /// gone. The transfer itself keeps running either way.
    pub client: Option<u64>,
    pub cancel: CancelHandle,
}

/// Live transfers, keyed `filename|port` once the bot has answered. Before
/// that each entry waits in a pending list under the bot's nick; the first
/// SEND from that bot promotes it.
#[derive(Default)]
pub struct Registry {
    pending: Vec<(String, RegistryEntry)>,
    active: HashMap<String, RegistryEntry>,
}

pub fn registry_key(filename: &str, port: u16) -> String {
    format!("{filename}|{port}")
}

pub type SharedRegistry = Arc<tokio::sync::Mutex<Registry>>;

pub fn shared() -> SharedRegistry {
    Arc::new(tokio::sync::Mutex::new(Registry::default()))
}

impl Registry {
    pub fn insert_pending(&mut self, bot_nick: &str, entry: RegistryEntry) {
        self.pending.push((bot_nick.to_string(), entry));
    }

    /// Rekey the oldest pending entry for `bot_nick` under `(filename, port)`.
    /// A single bot may have several transfers in flight; each SEND promotes
    /// one of them.
    pub fn promote(&mut self, bot_nick: &str, filename: &str, port: u16) -> Option<String> {
        let idx = self.pending.iter().position(|(bot, _)| bot == bot_nick)?;
        let (_, entry) = self.pending.remove(idx);
        let key = registry_key(filename, port);
        self.active.insert(key.clone(), entry);
        Some(key)
    }

    pub fn get(&self, key: &str) -> Option<&RegistryEntry> {
        self.active.get(key)
    }

    /// The API client behind `client` disconnected; forget the socket on
    /// every entry it owned and report how many were affected.
    pub fn detach_client(&mut self, client: u64) -> usize {
        let mut detached = 0;
        for entry in self
            .active
            .values_mut()
            .chain(self.pending.iter_mut().map(|(_, e)| e))
        {
            if entry.client == Some(client) {
                entry.client = None;
                detached += 1;
            }
        }
        detached
    }

    pub fn remove(&mut self, key: &str) -> Option<RegistryEntry> {
        self.active.remove(key)
    }

    /// Drop pending entries owned by `client`; used when a transfer ends
    /// before the bot ever answered.
    pub fn remove_pending_for_client(&mut self, client: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(_, e)| e.client != Some(client));
        before - self.pending.len()
    }

    /// Remove entries that have had no client for over [`STALE_AFTER`].
    /// Factored out of the sweeper task so it can be tested directly.
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<(String, RegistryEntry)> {
        let is_stale = |e: &RegistryEntry| {
            e.client.is_none() && now.saturating_duration_since(e.started_at) > STALE_AFTER
        };
        let mut removed = Vec::new();
        let stale_keys: Vec<String> = self
            .active
            .iter()
            .filter(|(_, e)| is_stale(e))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale_keys {
            if let Some(entry) = self.active.remove(&key) {
                removed.push((key, entry));
            }
        }
        let mut i = 0;
        while i < self.pending.len() {
            if is_stale(&self.pending[i].1) {
                let (bot, entry) = self.pending.remove(i);
                removed.push((format!("pending:{bot}"), entry));
            } else {
                i += 1;
            }
        }
        removed
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Periodic sweeper killing transfers whose client left over an hour ago.
pub fn spawn_gc(registry: SharedRegistry) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(GC_SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await; // the immediate first tick would sweep an empty map
        loop {
            tick.tick().await;
            let removed = registry.lock().await.sweep_stale(Instant::now());
            for (key, entry) in removed {
                tracing::info!(
                    key = %key,
                    pack = %entry.pack_number,
                    "reaping abandoned transfer"
                );
                entry.cancel.cancel();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;

    fn entry(client: Option<u64>, started_at: Instant) -> RegistryEntry {
        let (tx, _rx) = watch::channel(false);
        RegistryEntry {
            pack_number: "7".to_string(),
            send_progress: true,
            started_at,
            client,
            cancel: CancelHandle::from_sender(tx),
        }
    }

    #[test]
    fn key_joins_filename_and_port() {
        assert_eq!(registry_key("a.bin", 5000), "a.bin|5000");
    }

    #[test]
    fn promote_rekeys_oldest_pending_entry() {
        let mut reg = Registry::default();
        reg.insert_pending("Bot|A", entry(Some(1), Instant::now()));
        reg.insert_pending("Bot|A", entry(Some(2), Instant::now()));

        let key = reg.promote("Bot|A", "a.bin", 5000).expect("promote first");
        assert_eq!(key, "a.bin|5000");
        assert_eq!(reg.get(&key).expect("entry").client, Some(1));
        assert_eq!(reg.pending_len(), 1);

        let key2 = reg.promote("Bot|A", "b.bin", 5001).expect("promote second");
        assert_eq!(reg.get(&key2).expect("entry").client, Some(2));
        assert_eq!(reg.pending_len(), 0);

        assert!(reg.promote("Bot|A", "c.bin", 5002).is_none());
    }

    #[test]
    fn promote_ignores_other_bots() {
        let mut reg = Registry::default();
        reg.insert_pending("Bot|A", entry(Some(1), Instant::now()));
        assert!(reg.promote("Bot|B", "a.bin", 5000).is_none());
        assert_eq!(reg.pending_len(), 1);
    }

    #[test]
    fn detach_clears_every_entry_of_that_client() {
        let mut reg = Registry::default();
        reg.insert_pending("Bot|A", entry(Some(9), Instant::now()));
        reg.insert_pending("Bot|B", entry(Some(9), Instant::now()));
        let key = reg.promote("Bot|A", "a.bin", 5000).expect("promote");

        assert_eq!(reg.detach_client(9), 2);
        assert_eq!(reg.get(&key).expect("entry").client, None);
        assert_eq!(reg.detach_client(9), 0);
    }

    #[test]
    fn sweep_only_reaps_old_clientless_entries() {
        let mut reg = Registry::default();
        let born = Instant::now();
        reg.insert_pending("Bot|A", entry(None, born));
        reg.insert_pending("Bot|B", entry(Some(1), born));
        let key = reg.promote("Bot|B", "b.bin", 5001).expect("promote");
        reg.insert_pending("Bot|C", entry(None, born));
        let stale_key = reg.promote("Bot|C", "c.bin", 5002).expect("promote");

        // Nothing is old enough yet.
        assert!(reg.sweep_stale(born).is_empty());

        let later = born + STALE_AFTER + Duration::from_secs(1);
        let removed = reg.sweep_stale(later);
        let removed_keys: Vec<&str> = removed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(removed.len(), 2);
        assert!(removed_keys.contains(&stale_key.as_str()));
        assert!(removed_keys.contains(&"pending:Bot|A"));
        // The attached entry survives however old it is.
        assert!(reg.get(&key).is_some());
    }

    #[test]
    fn remove_pending_for_client_only_touches_that_client() {
        let mut reg = Registry::default();
        reg.insert_pending("Bot|A", entry(Some(1), Instant::now()));
        reg.insert_pending("Bot|A", entry(Some(2), Instant::now()));
        assert_eq!(reg.remove_pending_for_client(1), 1);
        assert_eq!(reg.pending_len(), 1);
    }
}
