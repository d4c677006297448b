//! An in-memory cluster for driving the batching client end to end.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use iox_time::{MockProvider, Time};
use metric::Registry;
use parking_lot::Mutex;
use regionkv_client::{
    BatchingClient, BatchingClientArgs, ClientConfig, LocationResolver, MultiAction,
    MultiResponse, RegionId, RegionLocation, RegionTransport, ResolveError, ServerAddr,
    ServerError, TransportError,
};

/// The authoritative region layout: each region owns the rows from its start
/// key up to the next region's start key.
#[derive(Debug, Default)]
pub(crate) struct Placement {
    regions: Mutex<BTreeMap<Bytes, RegionLocation>>,
}

impl Placement {
    /// Build a layout from `(start_key, region_name, server)` triples.
    pub(crate) fn new(regions: &[(&'static str, &'static str, &'static str)]) -> Arc<Self> {
        let regions = regions
            .iter()
            .map(|&(start, name, server)| {
                (
                    Bytes::from_static(start.as_bytes()),
                    RegionLocation {
                        region: RegionId::new(name, 1),
                        server: ServerAddr::new(server),
                    },
                )
            })
            .collect();
        Arc::new(Self {
            regions: Mutex::new(regions),
        })
    }

    pub(crate) fn locate(&self, row: &Bytes) -> Option<RegionLocation> {
        self.regions
            .lock()
            .range(..=row.clone())
            .next_back()
            .map(|(_, l)| l.clone())
    }

    /// Reassign the region called `name` to `server`, bumping its epoch.
    pub(crate) fn move_region(&self, name: &str, server: &str) {
        let mut regions = self.regions.lock();
        let location = regions
            .values_mut()
            .find(|l| l.region.name() == name.as_bytes())
            .expect("unknown region");
        let epoch = location.region.epoch() + 1;
        location.region = RegionId::new(location.region.name().clone(), epoch);
        location.server = ServerAddr::new(server);
    }

    /// Split the region called `name` at `at`, bumping its epoch. The upper
    /// half becomes region `upper` on `server`.
    pub(crate) fn split(&self, name: &str, at: &'static str, upper: &str, server: &str) {
        let mut regions = self.regions.lock();
        let location = regions
            .values_mut()
            .find(|l| l.region.name() == name.as_bytes())
            .expect("unknown region");
        let epoch = location.region.epoch() + 1;
        location.region = RegionId::new(location.region.name().clone(), epoch);
        regions.insert(
            Bytes::from_static(at.as_bytes()),
            RegionLocation {
                region: RegionId::new(upper.to_string(), 1),
                server: ServerAddr::new(server),
            },
        );
    }

    fn is_current(&self, region: &RegionId, server: &ServerAddr) -> bool {
        self.regions
            .lock()
            .values()
            .any(|l| &l.region == region && &l.server == server)
    }
}

/// A resolver caching answers per row until the region is invalidated, like
/// a real client-side location cache.
#[derive(Debug)]
pub(crate) struct CachingResolver {
    placement: Arc<Placement>,
    cache: Mutex<HashMap<Bytes, RegionLocation>>,
    delays: Mutex<HashMap<Bytes, Duration>>,
    lookups: Mutex<usize>,
    invalidated: Mutex<Vec<RegionId>>,
}

impl CachingResolver {
    pub(crate) fn new(placement: Arc<Placement>) -> Self {
        Self {
            placement,
            cache: Default::default(),
            delays: Default::default(),
            lookups: Default::default(),
            invalidated: Default::default(),
        }
    }

    /// Number of lookups that missed the cache.
    pub(crate) fn lookups(&self) -> usize {
        *self.lookups.lock()
    }

    /// Make every later cache miss for `row` take `delay`.
    pub(crate) fn set_lookup_delay(&self, row: &'static str, delay: Duration) {
        self.delays.lock().insert(Bytes::from_static(row.as_bytes()), delay);
    }

    pub(crate) fn invalidated(&self) -> Vec<RegionId> {
        self.invalidated.lock().clone()
    }
}

#[async_trait]
impl LocationResolver for CachingResolver {
    async fn resolve(&self, table: &Bytes, row: &Bytes) -> Result<RegionLocation, ResolveError> {
        if let Some(l) = self.cache.lock().get(row) {
            return Ok(l.clone());
        }

        *self.lookups.lock() += 1;
        let delay = self.delays.lock().get(row).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let location = self
            .placement
            .locate(row)
            .ok_or_else(|| ResolveError::TableNotFound(String::from_utf8_lossy(table).into()))?;
        self.cache.lock().insert(row.clone(), location.clone());
        Ok(location)
    }

    fn invalidate(&self, region: &RegionId) {
        self.cache.lock().retain(|_, l| &l.region != region);
        self.invalidated.lock().push(region.clone());
    }
}

/// One consolidated request as seen by the cluster.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub(crate) server: ServerAddr,
    pub(crate) region: RegionId,
    /// `(row, family)` of each action, in wire order.
    pub(crate) actions: Vec<(Bytes, Bytes)>,
}

#[derive(Debug, Default)]
struct ClusterState {
    requests: Vec<Request>,
    always_fail: Option<TransportError>,
}

/// Region servers answering from a shared [`Placement`].
///
/// Actions sent to a server that does not currently host the addressed
/// region fail with [`ServerError::NotServingRegion`]. Successful actions
/// return their row key.
#[derive(Debug)]
pub(crate) struct FakeCluster {
    placement: Arc<Placement>,
    latency: Duration,
    server_latency: HashMap<ServerAddr, Duration>,
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub(crate) fn new(placement: Arc<Placement>) -> Self {
        Self {
            placement,
            latency: Duration::ZERO,
            server_latency: Default::default(),
            state: Default::default(),
        }
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Override the latency of requests sent to `server`.
    pub(crate) fn with_server_latency(mut self, server: &str, latency: Duration) -> Self {
        self.server_latency.insert(ServerAddr::new(server), latency);
        self
    }

    /// Fail every request with `e`.
    pub(crate) fn with_always_fail(self, e: TransportError) -> Self {
        self.state.lock().always_fail = Some(e);
        self
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.state.lock().requests.clone()
    }

    /// Total number of actions received across all requests.
    pub(crate) fn actions_received(&self) -> usize {
        self.state.lock().requests.iter().map(|r| r.actions.len()).sum()
    }
}

#[async_trait]
impl RegionTransport for FakeCluster {
    async fn send(
        &self,
        server: &ServerAddr,
        request: MultiAction,
    ) -> Result<MultiResponse, TransportError> {
        let actions = request
            .actions
            .iter()
            .map(|op| (op.rpc().row().clone(), op.rpc().family().clone()))
            .collect::<Vec<_>>();

        let injected = {
            let mut state = self.state.lock();
            state.requests.push(Request {
                server: server.clone(),
                region: request.region.clone(),
                actions: actions.clone(),
            });
            state.always_fail.clone()
        };

        let latency = self
            .server_latency
            .get(server)
            .copied()
            .unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(e) = injected {
            return Err(e);
        }

        let outcomes = if self.placement.is_current(&request.region, server) {
            actions.into_iter().map(|(row, _)| Ok(row)).collect()
        } else {
            vec![Err(ServerError::NotServingRegion); actions.len()]
        };
        Ok(MultiResponse { outcomes })
    }
}

/// A client wired to `resolver` and `cluster`.
pub(crate) fn client(
    resolver: &Arc<CachingResolver>,
    cluster: &Arc<FakeCluster>,
    config: ClientConfig,
) -> BatchingClient {
    BatchingClient::new(BatchingClientArgs {
        resolver: Arc::clone(resolver) as _,
        transport: Arc::clone(cluster) as _,
        time_provider: Arc::new(MockProvider::new(Time::from_timestamp_nanos(0))),
        metric_registry: Arc::new(Registry::default()),
        config,
    })
}
