//! Tile cache with a priority-aware cooperative scheduler.
//!
//! Decoded tiles are stored per map, keyed by `(level, x, y)`. Rendering
//! layers attach as cache clients and are driven through a three-callback
//! protocol: `query` asks a client for the next tile it wants (and the
//! priority it wants to keep), `notify` announces a freshly inserted node
//! on a monitored level, and `eval` prices a node during eviction.
//!
//! All of this runs on the single event-loop thread. The scheduler does at
//! most one tile read per task iteration so the loop stays responsive, and
//! a cleanup task trims each map back to the low watermark once its
//! decoded footprint passes the high watermark.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use log::{debug, warn};

use crate::decoder::Pixmap;
use crate::map::Map;
use crate::shell::{CacheTask, Shell, TaskOutcome};

/// Highest client priority; also the number of retention classes.
pub const MAX_PRIO: u32 = 3;
/// Lowest priority the low-priority scheduler task still services.
pub const MIN_PRIO: u32 = 1;

/// Tile coordinate within one map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub level: u32,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(level: u32, x: u32, y: u32) -> Self {
        Self { level, x, y }
    }
}

/// Identifier of a map registered with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapId(u32);

/// Identifier of an attached cache client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u32);

/// One cached tile.
///
/// `Data` nodes count `tile_w * tile_h * 4` bytes toward the owning map's
/// footprint; `Color` and `Error` nodes are free. An `Error` node records
/// a failed load and prevents retry storms.
#[derive(Debug, Clone)]
pub enum TileNode {
    Error,
    Color(u32),
    Data(Pixmap),
}

/// Reply of a client to a `query` callback.
#[derive(Debug, Clone)]
pub enum TileQuery {
    /// Nothing to do; the client is demoted to the idle bucket.
    Idle,
    /// Load this tile; `prio` is also the priority class the client wants
    /// to keep after the tile has been serviced.
    Load {
        prio: u32,
        map: Rc<Map>,
        key: TileKey,
    },
}

/// The consumer side of the cache protocol.
pub trait CacheClient {
    /// Return the next tile this client wants, or [`TileQuery::Idle`].
    fn query(&mut self, cache: &TileCache) -> TileQuery;

    /// A node appeared on the level this client monitors. Priority changes
    /// made here must go through [`TileCache::queue_attention`]; they are
    /// applied right after the fan-out and honored on the next turn.
    fn notify(&mut self, cache: &TileCache, map: MapId, key: TileKey, node: &TileNode);

    /// How much this client values the node, `0..=MAX_PRIO`. A node's
    /// retention priority is the maximum over all evaluators.
    fn eval(&self, key: TileKey, node: &TileNode) -> u32;
}

struct Client {
    ops: Rc<RefCell<dyn CacheClient>>,
    prio: u32,
    monitored: Option<(MapId, u32)>,
}

struct MapCache {
    /// Bytes one `Data` node costs: `tile_w * tile_h * 4`.
    node_size: usize,
    /// Aggregate footprint of `Data` nodes.
    act_size: usize,
    nodes: HashMap<TileKey, TileNode>,
    /// Insertion order; eviction scans oldest-first.
    order: VecDeque<TileKey>,
    /// Notify subscribers per level.
    levels: Vec<Vec<ClientId>>,
}

/// The tile cache and its cooperative scheduler.
pub struct TileCache {
    low_size: usize,
    high_size: usize,
    maps: HashMap<MapId, MapCache>,
    clients: HashMap<ClientId, Client>,
    buckets: [VecDeque<ClientId>; (MAX_PRIO + 1) as usize],
    next_map: u32,
    next_client: u32,
    /// Attention requests queued from inside notify callbacks.
    pending: RefCell<Vec<(ClientId, u32)>>,
    shell: Rc<dyn Shell>,
}

impl TileCache {
    /// Create a cache with the given low/high watermarks in bytes.
    pub fn new(low_size: usize, high_size: usize, shell: Rc<dyn Shell>) -> Self {
        Self {
            low_size,
            high_size,
            maps: HashMap::new(),
            clients: HashMap::new(),
            buckets: Default::default(),
            next_map: 0,
            next_client: 0,
            pending: RefCell::new(Vec::new()),
            shell,
        }
    }

    /// Register a map's tile geometry and get its cache identity.
    pub fn register_map(&mut self, tile_w: u32, tile_h: u32, num_levels: u32) -> MapId {
        let id = MapId(self.next_map);
        self.next_map += 1;

        self.maps.insert(
            id,
            MapCache {
                node_size: tile_w as usize * tile_h as usize * 4,
                act_size: 0,
                nodes: HashMap::new(),
                order: VecDeque::new(),
                levels: vec![Vec::new(); num_levels as usize],
            },
        );
        id
    }

    /// Drop a map and all of its nodes; clients monitoring it stop
    /// receiving notifications.
    pub fn remove_map(&mut self, map: MapId) {
        self.maps.remove(&map);
        for client in self.clients.values_mut() {
            if client.monitored.is_some_and(|(m, _)| m == map) {
                client.monitored = None;
            }
        }
    }

    /// Look up the node at `key`, if any.
    pub fn lookup(&self, map: MapId, key: TileKey) -> Option<&TileNode> {
        self.maps.get(&map)?.nodes.get(&key)
    }

    /// Aggregate `Data` footprint of a map in bytes.
    pub fn footprint(&self, map: MapId) -> usize {
        self.maps.get(&map).map_or(0, |m| m.act_size)
    }

    /// Number of nodes a map currently holds.
    pub fn node_count(&self, map: MapId) -> usize {
        self.maps.get(&map).map_or(0, |m| m.nodes.len())
    }

    /// Current priority bucket of a client.
    pub fn client_prio(&self, client: ClientId) -> Option<u32> {
        self.clients.get(&client).map(|c| c.prio)
    }

    /// Attach a client; it starts out idle in bucket 0.
    pub fn make_client(&mut self, ops: Rc<RefCell<dyn CacheClient>>) -> ClientId {
        let id = ClientId(self.next_client);
        self.next_client += 1;

        self.clients.insert(
            id,
            Client {
                ops,
                prio: 0,
                monitored: None,
            },
        );
        self.buckets[0].push_back(id);
        id
    }

    /// Detach a client from its priority bucket and notify list.
    pub fn discard_client(&mut self, client: ClientId) {
        let Some(c) = self.clients.remove(&client) else {
            return;
        };
        self.buckets[c.prio as usize].retain(|id| *id != client);
        if let Some((map, level)) = c.monitored {
            self.unsubscribe(client, map, level);
        }
        self.pending.borrow_mut().retain(|(id, _)| *id != client);
    }

    fn unsubscribe(&mut self, client: ClientId, map: MapId, level: u32) {
        if let Some(mc) = self.maps.get_mut(&map) {
            if let Some(subs) = mc.levels.get_mut(level as usize) {
                subs.retain(|id| *id != client);
            }
        }
    }

    /// Subscribe `client` to node notifications on exactly one
    /// `(map, level)` pair, replacing any previous subscription.
    pub fn request_notification(&mut self, client: ClientId, map: MapId, level: u32) {
        let Some(old) = self.clients.get(&client).map(|c| c.monitored) else {
            return;
        };
        if let Some((old_map, old_level)) = old {
            self.unsubscribe(client, old_map, old_level);
        }

        let Some(mc) = self.maps.get_mut(&map) else {
            warn!("notification request for unknown map");
            return;
        };
        let Some(subs) = mc.levels.get_mut(level as usize) else {
            warn!("notification request for level {} out of range", level);
            return;
        };
        subs.push(client);

        if let Some(c) = self.clients.get_mut(&client) {
            c.monitored = Some((map, level));
        }
    }

    fn move_client(&mut self, client: ClientId, prio: u32) {
        let Some(c) = self.clients.get_mut(&client) else {
            return;
        };
        if c.prio == prio {
            return;
        }
        let old = c.prio;
        c.prio = prio;
        self.buckets[old as usize].retain(|id| *id != client);
        self.buckets[prio as usize].push_back(client);
    }

    /// Move a client to the given priority bucket and make sure the
    /// scheduler tasks are queued.
    pub fn request_attention(&mut self, client: ClientId, prio: u32) {
        self.move_client(client, prio.min(MAX_PRIO));
        self.register_event_source();
    }

    /// Queue an attention request from inside a notify callback. Applied
    /// after the current fan-out completes.
    pub fn queue_attention(&self, client: ClientId, prio: u32) {
        self.pending.borrow_mut().push((client, prio));
    }

    fn top_priority(&self) -> u32 {
        for i in (1..=MAX_PRIO).rev() {
            if !self.buckets[i as usize].is_empty() {
                return i;
            }
        }
        0
    }

    fn register_event_source(&self) {
        let top = self.top_priority();
        if top == MAX_PRIO {
            self.shell.schedule_task(CacheTask::HighPrio);
        }
        if top > 0 {
            self.shell.schedule_task(CacheTask::LowPrio);
        }
    }

    /// Insert a node, notifying every subscriber of `(map, key.level)`.
    ///
    /// This is the reader-facing half of the protocol: one `read_tile`
    /// outcome becomes exactly one insertion. Replacing an existing node
    /// is tolerated but logged; the old node is unlinked first so the
    /// footprint stays exact.
    pub fn insert(&mut self, map: MapId, key: TileKey, node: TileNode) {
        {
            let Some(mc) = self.maps.get_mut(&map) else {
                warn!("insert into unknown map");
                return;
            };

            if let Some(old) = mc.nodes.insert(key, node.clone()) {
                warn!(
                    "duplicate node for L{} X{} Y{}, replacing",
                    key.level, key.x, key.y
                );
                if matches!(old, TileNode::Data(_)) {
                    mc.act_size -= mc.node_size;
                }
                mc.order.retain(|k| *k != key);
            }
            mc.order.push_back(key);

            if matches!(node, TileNode::Data(_)) {
                mc.act_size += mc.node_size;
            }

            if mc.act_size > self.high_size {
                self.shell.schedule_task(CacheTask::Cleanup);
            }
        }

        for ops in self.subscribers(map, key.level) {
            ops.borrow_mut().notify(&*self, map, key, &node);
        }

        let pending: Vec<_> = self.pending.borrow_mut().drain(..).collect();
        if !pending.is_empty() {
            for (client, prio) in pending {
                self.move_client(client, prio.min(MAX_PRIO));
            }
            self.register_event_source();
        }
    }

    fn subscribers(&self, map: MapId, level: u32) -> Vec<Rc<RefCell<dyn CacheClient>>> {
        let Some(mc) = self.maps.get(&map) else {
            return Vec::new();
        };
        let Some(subs) = mc.levels.get(level as usize) else {
            return Vec::new();
        };
        subs.iter()
            .filter_map(|id| self.clients.get(id).map(|c| c.ops.clone()))
            .collect()
    }

    /// Read one tile through the map's reader and insert the outcome.
    pub fn load_tile(&mut self, map: &Map, key: TileKey) {
        let node = map.read_tile(key.level, key.x, key.y);
        self.insert(map.id(), key, node);
    }

    /// Run one scheduled task iteration.
    pub fn run_task(&mut self, task: CacheTask) -> TaskOutcome {
        match task {
            CacheTask::HighPrio => self.run_iteration(MAX_PRIO),
            CacheTask::LowPrio => self.run_iteration(MIN_PRIO),
            CacheTask::Cleanup => {
                self.cleanup();
                TaskOutcome::Stop
            }
        }
    }

    /// One scheduler iteration: find the most urgent missing tile among
    /// clients in buckets `>= least_prio` and load it. Clients answering
    /// with a different priority than their bucket are just re-filed, so
    /// an idle client drains in O(1) without costing a read.
    fn run_iteration(&mut self, least_prio: u32) -> TaskOutcome {
        match self.query_clients(least_prio) {
            Some((map, key)) => {
                self.load_tile(&map, key);
                TaskOutcome::Again
            }
            None => TaskOutcome::Stop,
        }
    }

    fn query_clients(&mut self, least_prio: u32) -> Option<(Rc<Map>, TileKey)> {
        for i in (least_prio..=MAX_PRIO).rev() {
            while let Some(&id) = self.buckets[i as usize].front() {
                let Some(ops) = self.clients.get(&id).map(|c| c.ops.clone()) else {
                    self.buckets[i as usize].pop_front();
                    continue;
                };

                let reply = ops.borrow_mut().query(&*self);

                match reply {
                    TileQuery::Load { prio, map, key } => {
                        let prio = prio.min(MAX_PRIO);
                        if prio == i {
                            return Some((map, key));
                        }
                        if prio > i {
                            warn!("priority raise during query");
                        }
                        self.move_client(id, prio);
                    }
                    TileQuery::Idle => {
                        self.move_client(id, 0);
                    }
                }
            }
        }
        None
    }

    fn cleanup(&mut self) {
        let map_ids: Vec<MapId> = self.maps.keys().copied().collect();
        for id in map_ids {
            self.cleanup_map(id);
        }
    }

    /// Trim one map: for retention classes in ascending order, destroy
    /// every node no evaluator prices above the class, stopping once the
    /// footprint drops to the low watermark.
    fn cleanup_map(&mut self, map: MapId) {
        let mut cleaned = 0usize;

        for prio in 0..MAX_PRIO {
            let keys: Vec<TileKey> = match self.maps.get(&map) {
                Some(mc) => mc.order.iter().copied().collect(),
                None => return,
            };

            for key in keys {
                let Some(mc) = self.maps.get(&map) else {
                    return;
                };
                if mc.act_size <= self.low_size {
                    self.prune_order(map);
                    debug!(
                        "cleanup finished during phase {} ({} nodes destroyed)",
                        prio, cleaned
                    );
                    return;
                }

                let Some(node) = mc.nodes.get(&key).cloned() else {
                    continue;
                };

                let mut node_prio = 0;
                for ops in self.subscribers(map, key.level) {
                    node_prio = node_prio.max(ops.borrow().eval(key, &node));
                }

                if node_prio <= prio {
                    self.destroy_node(map, key);
                    cleaned += 1;
                }
            }

            self.prune_order(map);
        }

        debug!("cleanup ran out of phases ({} nodes destroyed)", cleaned);
    }

    fn prune_order(&mut self, map: MapId) {
        if let Some(mc) = self.maps.get_mut(&map) {
            let MapCache { order, nodes, .. } = mc;
            order.retain(|k| nodes.contains_key(k));
        }
    }

    fn destroy_node(&mut self, map: MapId, key: TileKey) {
        let Some(mc) = self.maps.get_mut(&map) else {
            return;
        };
        if let Some(node) = mc.nodes.remove(&key) {
            if matches!(node, TileNode::Data(_)) {
                mc.act_size -= mc.node_size;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{build_test_map, pump, RecordingShell};

    fn test_pixmap(w: u32, h: u32) -> Pixmap {
        Pixmap::new(vec![0u8; (w * h * 4) as usize], w, h)
    }

    /// Client that answers queries from a script and records notifies.
    struct ScriptedClient {
        id: Option<ClientId>,
        map: Option<Rc<Map>>,
        queries: VecDeque<(u32, TileKey)>,
        notified: Vec<TileKey>,
        eval_score: u32,
        raise_on_notify: Option<u32>,
    }

    impl ScriptedClient {
        fn new() -> Self {
            Self {
                id: None,
                map: None,
                queries: VecDeque::new(),
                notified: Vec::new(),
                eval_score: 0,
                raise_on_notify: None,
            }
        }
    }

    impl CacheClient for ScriptedClient {
        fn query(&mut self, _cache: &TileCache) -> TileQuery {
            match (self.queries.pop_front(), &self.map) {
                (Some((prio, key)), Some(map)) => TileQuery::Load {
                    prio,
                    map: Rc::clone(map),
                    key,
                },
                _ => TileQuery::Idle,
            }
        }

        fn notify(&mut self, cache: &TileCache, _map: MapId, key: TileKey, _node: &TileNode) {
            self.notified.push(key);
            if let (Some(prio), Some(id)) = (self.raise_on_notify, self.id) {
                cache.queue_attention(id, prio);
            }
        }

        fn eval(&self, _key: TileKey, _node: &TileNode) -> u32 {
            self.eval_score
        }
    }

    #[test]
    fn insert_then_lookup_returns_the_node() {
        let shell = Rc::new(RecordingShell::new());
        let mut cache = TileCache::new(1 << 20, 4 << 20, shell);
        let map = cache.register_map(2, 2, 3);

        let key = TileKey::new(1, 4, 7);
        cache.insert(map, key, TileNode::Color(0xABCDEF));

        assert!(matches!(
            cache.lookup(map, key),
            Some(TileNode::Color(0xABCDEF))
        ));
        assert!(cache.lookup(map, TileKey::new(1, 4, 8)).is_none());
        assert!(cache.lookup(map, TileKey::new(0, 4, 7)).is_none());
    }

    #[test]
    fn footprint_counts_only_data_nodes() {
        let shell = Rc::new(RecordingShell::new());
        let mut cache = TileCache::new(1 << 20, 4 << 20, shell);
        let map = cache.register_map(2, 2, 2);
        let node_size = 2 * 2 * 4;

        cache.insert(map, TileKey::new(0, 0, 0), TileNode::Data(test_pixmap(2, 2)));
        cache.insert(map, TileKey::new(0, 1, 0), TileNode::Data(test_pixmap(2, 2)));
        cache.insert(map, TileKey::new(0, 2, 0), TileNode::Color(0xFFFFFF));
        cache.insert(map, TileKey::new(0, 3, 0), TileNode::Error);

        assert_eq!(cache.footprint(map), 2 * node_size);
        assert_eq!(cache.node_count(map), 4);
    }

    #[test]
    fn duplicate_insert_keeps_footprint_exact() {
        let shell = Rc::new(RecordingShell::new());
        let mut cache = TileCache::new(1 << 20, 4 << 20, shell);
        let map = cache.register_map(2, 2, 1);
        let key = TileKey::new(0, 0, 0);

        cache.insert(map, key, TileNode::Data(test_pixmap(2, 2)));
        cache.insert(map, key, TileNode::Data(test_pixmap(2, 2)));

        assert_eq!(cache.footprint(map), 2 * 2 * 4);
        assert_eq!(cache.node_count(map), 1);
    }

    #[test]
    fn cleanup_trims_to_low_watermark() {
        // High watermark = 5 data tiles, low = 3, no clients: all evals 0.
        let node_size = 2 * 2 * 4;
        let shell = Rc::new(RecordingShell::new());
        let cache = Rc::new(RefCell::new(TileCache::new(
            3 * node_size,
            5 * node_size,
            shell.clone(),
        )));
        let map = cache.borrow_mut().register_map(2, 2, 1);

        for i in 0..6 {
            cache
                .borrow_mut()
                .insert(map, TileKey::new(0, i, 0), TileNode::Data(test_pixmap(2, 2)));
        }
        assert!(shell.has_task(CacheTask::Cleanup));

        pump(&shell, &cache);

        let cache = cache.borrow();
        assert!(cache.node_count(map) <= 3);
        assert!(cache.footprint(map) <= 3 * node_size);
    }

    #[test]
    fn cleanup_spares_highly_valued_nodes() {
        let node_size = 2 * 2 * 4;
        let shell = Rc::new(RecordingShell::new());
        let cache = Rc::new(RefCell::new(TileCache::new(
            node_size,
            2 * node_size,
            shell.clone(),
        )));
        let map = cache.borrow_mut().register_map(2, 2, 1);

        let mut client = ScriptedClient::new();
        client.eval_score = MAX_PRIO;
        let client = Rc::new(RefCell::new(client));
        let id = cache.borrow_mut().make_client(client.clone());
        cache.borrow_mut().request_notification(id, map, 0);

        for i in 0..3 {
            cache
                .borrow_mut()
                .insert(map, TileKey::new(0, i, 0), TileNode::Data(test_pixmap(2, 2)));
        }

        pump(&shell, &cache);

        // every node priced at MAX_PRIO: nothing may be destroyed even
        // though the footprint stays above the low watermark
        assert_eq!(cache.borrow().node_count(map), 3);
    }

    #[test]
    fn cleanup_destroys_in_ascending_priority_classes() {
        let node_size = 2 * 2 * 4;
        let shell = Rc::new(RecordingShell::new());
        let cache = Rc::new(RefCell::new(TileCache::new(
            node_size,
            2 * node_size,
            shell.clone(),
        )));
        let map = cache.borrow_mut().register_map(2, 2, 2);

        // level 0 is priced at 2, level 1 at 0
        let mut priced = ScriptedClient::new();
        priced.eval_score = 2;
        let priced = Rc::new(RefCell::new(priced));
        let id = cache.borrow_mut().make_client(priced.clone());
        cache.borrow_mut().request_notification(id, map, 0);

        cache
            .borrow_mut()
            .insert(map, TileKey::new(0, 0, 0), TileNode::Data(test_pixmap(2, 2)));
        cache
            .borrow_mut()
            .insert(map, TileKey::new(1, 0, 0), TileNode::Data(test_pixmap(2, 2)));
        cache
            .borrow_mut()
            .insert(map, TileKey::new(1, 1, 0), TileNode::Data(test_pixmap(2, 2)));

        pump(&shell, &cache);

        // the unpriced level-1 nodes go first
        let cache = cache.borrow();
        assert!(cache.lookup(map, TileKey::new(0, 0, 0)).is_some());
        assert!(cache.footprint(map) <= node_size);
    }

    #[test]
    fn notify_is_delivered_synchronously_on_insert() {
        let shell = Rc::new(RecordingShell::new());
        let mut cache = TileCache::new(1 << 20, 4 << 20, shell);
        let map = cache.register_map(2, 2, 2);

        let client = Rc::new(RefCell::new(ScriptedClient::new()));
        let id = cache.make_client(client.clone());
        cache.request_notification(id, map, 1);

        cache.insert(map, TileKey::new(1, 2, 3), TileNode::Error);
        cache.insert(map, TileKey::new(0, 0, 0), TileNode::Error); // other level

        assert_eq!(client.borrow().notified, vec![TileKey::new(1, 2, 3)]);
    }

    #[test]
    fn renotification_moves_the_subscription() {
        let shell = Rc::new(RecordingShell::new());
        let mut cache = TileCache::new(1 << 20, 4 << 20, shell);
        let map = cache.register_map(2, 2, 2);

        let client = Rc::new(RefCell::new(ScriptedClient::new()));
        let id = cache.make_client(client.clone());
        cache.request_notification(id, map, 0);
        cache.request_notification(id, map, 1);

        cache.insert(map, TileKey::new(0, 0, 0), TileNode::Error);
        cache.insert(map, TileKey::new(1, 0, 0), TileNode::Error);

        assert_eq!(client.borrow().notified, vec![TileKey::new(1, 0, 0)]);
    }

    #[test]
    fn attention_queued_during_notify_is_applied() {
        let shell = Rc::new(RecordingShell::new());
        let mut cache = TileCache::new(1 << 20, 4 << 20, shell.clone());
        let map = cache.register_map(2, 2, 1);

        let client = Rc::new(RefCell::new(ScriptedClient::new()));
        let id = cache.make_client(client.clone());
        client.borrow_mut().id = Some(id);
        client.borrow_mut().raise_on_notify = Some(2);
        cache.request_notification(id, map, 0);

        cache.insert(map, TileKey::new(0, 0, 0), TileNode::Error);

        assert_eq!(cache.client_prio(id), Some(2));
        assert!(shell.has_task(CacheTask::LowPrio));
    }

    #[test]
    fn scheduler_services_high_priority_first() {
        // Scenario: client 1 wants T at priority 3, client 2 wants T' at
        // priority 2; T must be loaded before T'.
        let temp = tempfile::TempDir::new().unwrap();
        let shell = Rc::new(RecordingShell::new());
        let cache = Rc::new(RefCell::new(TileCache::new(
            64 << 20,
            128 << 20,
            shell.clone(),
        )));
        let map = build_test_map(temp.path(), &cache);

        let t = TileKey::new(0, 0, 0);
        let t2 = TileKey::new(0, 1, 0);

        let mut c1 = ScriptedClient::new();
        c1.map = Some(Rc::clone(&map));
        c1.queries.push_back((3, t));
        let c1 = Rc::new(RefCell::new(c1));

        let mut c2 = ScriptedClient::new();
        c2.map = Some(Rc::clone(&map));
        c2.queries.push_back((2, t2));
        let c2 = Rc::new(RefCell::new(c2));

        let (id1, id2) = {
            let mut cache = cache.borrow_mut();
            (cache.make_client(c1.clone()), cache.make_client(c2.clone()))
        };
        cache.borrow_mut().request_attention(id2, 2);
        cache.borrow_mut().request_attention(id1, 3);

        // watch the insertion order while pumping
        pump(&shell, &cache);

        let cache = cache.borrow();
        let order: Vec<TileKey> = cache.maps[&map.id()].order.iter().copied().collect();
        assert_eq!(order, vec![t, t2]);
        assert!(cache.lookup(map.id(), t).is_some());
        assert!(cache.lookup(map.id(), t2).is_some());
    }

    #[test]
    fn idle_client_drains_to_bucket_zero() {
        let shell = Rc::new(RecordingShell::new());
        let cache = Rc::new(RefCell::new(TileCache::new(
            64 << 20,
            128 << 20,
            shell.clone(),
        )));

        let client = Rc::new(RefCell::new(ScriptedClient::new()));
        let id = cache.borrow_mut().make_client(client.clone());
        cache.borrow_mut().request_attention(id, 3);

        pump(&shell, &cache);

        assert_eq!(cache.borrow().client_prio(id), Some(0));
    }

    #[test]
    fn discarded_client_is_never_queried() {
        let shell = Rc::new(RecordingShell::new());
        let cache = Rc::new(RefCell::new(TileCache::new(
            64 << 20,
            128 << 20,
            shell.clone(),
        )));

        let mut client = ScriptedClient::new();
        client.queries.push_back((3, TileKey::new(0, 0, 0)));
        let client = Rc::new(RefCell::new(client));
        let id = cache.borrow_mut().make_client(client.clone());
        cache.borrow_mut().request_attention(id, 3);
        cache.borrow_mut().discard_client(id);

        pump(&shell, &cache);

        assert_eq!(client.borrow().queries.len(), 1);
    }

    #[test]
    fn remove_map_drops_nodes_and_subscriptions() {
        let shell = Rc::new(RecordingShell::new());
        let mut cache = TileCache::new(1 << 20, 4 << 20, shell);
        let map = cache.register_map(2, 2, 1);

        let client = Rc::new(RefCell::new(ScriptedClient::new()));
        let id = cache.make_client(client.clone());
        cache.request_notification(id, map, 0);

        cache.insert(map, TileKey::new(0, 0, 0), TileNode::Error);
        cache.remove_map(map);

        assert_eq!(cache.node_count(map), 0);
        assert!(cache.clients[&id].monitored.is_none());
    }
}
