//! Load-balancing and naming-service contracts.
//!
//! The core consumes both through traits: a [`NamingService`] turns a service
//! name into endpoints, a [`LoadBalancer`] picks a socket per attempt and
//! absorbs feedback. [`LoadBalancerWithNaming`] composes the two and owns the
//! socket-map references for the server set. Concrete selection algorithms
//! live outside the core and register themselves by name; naming services
//! register by URL scheme. Only `list://` ships here, because a static server
//! list has no moving parts worth abstracting away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tracing::warn;

use crate::endpoint::{self, Endpoint};
use crate::errors::{ErrorCode, InitError};
use crate::options::ServerFilter;
use crate::socket::SocketId;
use crate::socket_map;

/// Inputs to one server selection.
pub struct SelectIn<'a> {
    pub begin_time_us: i64,
    /// Caller-chosen routing key, for hash-style balancers.
    pub request_code: Option<u64>,
    /// Servers already tried by this call; retries avoid them.
    pub excluded: &'a [SocketId],
}

/// Result of one server selection.
pub struct SelectOut {
    pub socket: SocketId,
    /// Whether the balancer wants a `feedback` call when this attempt ends.
    pub need_feedback: bool,
}

/// Completion report for a selected server.
pub struct CallInfo {
    pub server_id: SocketId,
    pub error_code: ErrorCode,
    pub begin_time_us: i64,
}

/// A server-selection algorithm.
pub trait LoadBalancer: Send + Sync {
    fn select_server(&self, input: &SelectIn<'_>) -> Result<SelectOut, ErrorCode>;

    /// Report the outcome of an attempt whose selection asked for feedback.
    fn feedback(&self, _info: &CallInfo) {}

    /// Replace the live server set.
    fn reset_servers(&self, servers: &[SocketId]);

    fn weight(&self) -> i32 {
        0
    }

    fn describe(&self) -> String;
}

/// Maps a service name to a set of endpoints.
pub trait NamingService: Send + Sync {
    fn get_servers(&self, service_name: &str) -> Result<Vec<Endpoint>, NamingError>;
}

/// Failure to produce a server set.
#[derive(Debug)]
pub struct NamingError {
    message: String,
}

impl NamingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for NamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for NamingError {}

/// Startup tolerance for naming services that begin empty.
#[derive(Debug, Clone, Copy)]
pub struct NamingServiceOptions {
    pub succeed_without_server: bool,
    pub log_succeed_without_server: bool,
}

// ============================================================================
// Registries
// ============================================================================

type BalancerFactory = fn() -> Arc<dyn LoadBalancer>;

fn balancer_registry() -> &'static Mutex<HashMap<&'static str, BalancerFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, BalancerFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a selection algorithm under `name`. Later registrations under the
/// same name are ignored.
pub fn register_load_balancer(name: &'static str, factory: BalancerFactory) {
    balancer_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .entry(name)
        .or_insert(factory);
}

fn create_load_balancer(name: &str) -> Option<Arc<dyn LoadBalancer>> {
    let factory = *balancer_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)?;
    Some(factory())
}

fn naming_registry() -> &'static Mutex<HashMap<&'static str, Arc<dyn NamingService>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, Arc<dyn NamingService>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a naming service under a URL scheme (the part before `://`).
pub fn register_naming_service(scheme: &'static str, service: Arc<dyn NamingService>) {
    naming_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .entry(scheme)
        .or_insert(service);
}

fn find_naming_service(scheme: &str) -> Option<Arc<dyn NamingService>> {
    naming_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(scheme)
        .cloned()
}

// ============================================================================
// list:// naming service
// ============================================================================

/// Static server list: `list://host:port,host:port,...`.
struct ListNamingService;

impl NamingService for ListNamingService {
    fn get_servers(&self, service_name: &str) -> Result<Vec<Endpoint>, NamingError> {
        let mut servers = Vec::new();
        for part in service_name.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let ep = endpoint::str2endpoint(part)
                .or_else(|| endpoint::hostname2endpoint(part))
                .ok_or_else(|| NamingError::new(format!("invalid server `{part}'")))?;
            servers.push(ep);
        }
        Ok(servers)
    }
}

/// Register the built-in naming services. Called once from global init.
pub(crate) fn register_builtin_naming_services() {
    register_naming_service("list", Arc::new(ListNamingService));
}

// ============================================================================
// LoadBalancerWithNaming
// ============================================================================

/// A selection algorithm wired to a naming service's server set.
///
/// Owns one socket-map reference per live server, released when the last
/// holder (channel or in-flight controller) drops it.
pub struct LoadBalancerWithNaming {
    lb: Arc<dyn LoadBalancer>,
    naming: Arc<dyn NamingService>,
    service_name: String,
    filter: Option<Arc<dyn ServerFilter>>,
    description: String,
    servers: Mutex<Vec<(Endpoint, SocketId)>>,
}

impl std::fmt::Debug for LoadBalancerWithNaming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoadBalancerWithNaming[{}]", self.description)
    }
}

impl LoadBalancerWithNaming {
    /// Build and prime the composition from `ns_url` (`scheme://service`) and
    /// a registered balancer name.
    pub fn init(
        ns_url: &str,
        lb_name: &str,
        filter: Option<Arc<dyn ServerFilter>>,
        opts: &NamingServiceOptions,
    ) -> Result<Arc<Self>, InitError> {
        let Some((scheme, service_name)) = ns_url.split_once("://") else {
            return Err(InitError::NamingFailed(format!(
                "`{ns_url}' has no scheme"
            )));
        };
        let Some(naming) = find_naming_service(scheme) else {
            return Err(InitError::NamingFailed(format!(
                "unknown naming scheme `{scheme}'"
            )));
        };
        let Some(lb) = create_load_balancer(lb_name) else {
            return Err(InitError::BalancerUnknown(lb_name.to_string()));
        };

        let this = Arc::new(Self {
            lb,
            naming,
            service_name: service_name.to_string(),
            filter,
            description: format!("{lb_name}@{ns_url}"),
            servers: Mutex::new(Vec::new()),
        });
        let count = this.refresh().map_err(InitError::NamingFailed)?;
        if count == 0 {
            if !opts.succeed_without_server {
                return Err(InitError::NamingFailed(format!(
                    "no server is available from `{ns_url}'"
                )));
            }
            if opts.log_succeed_without_server {
                warn!(ns_url, "naming service starts with no server");
            }
        }
        Ok(this)
    }

    fn servers(&self) -> MutexGuard<'_, Vec<(Endpoint, SocketId)>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-fetch the server set and push it into the balancer. Returns the
    /// live server count.
    pub fn refresh(&self) -> Result<usize, String> {
        let mut fetched = self
            .naming
            .get_servers(&self.service_name)
            .map_err(|e| e.to_string())?;
        if let Some(filter) = &self.filter {
            fetched.retain(|ep| filter.accept(ep));
        }
        fetched.sort();
        fetched.dedup();

        let mut held = self.servers();
        let mut next = Vec::with_capacity(fetched.len());
        for ep in &fetched {
            match held.iter().find(|(held_ep, _)| held_ep == ep) {
                Some(&(_, id)) => next.push((*ep, id)),
                None => next.push((*ep, socket_map::insert(*ep))),
            }
        }
        for (ep, _) in held.iter() {
            if !fetched.contains(ep) {
                socket_map::remove(*ep);
            }
        }
        let ids: Vec<SocketId> = next.iter().map(|&(_, id)| id).collect();
        *held = next;
        drop(held);

        self.lb.reset_servers(&ids);
        Ok(ids.len())
    }

    pub fn select_server(&self, input: &SelectIn<'_>) -> Result<SelectOut, ErrorCode> {
        self.lb.select_server(input)
    }

    pub fn feedback(&self, info: &CallInfo) {
        self.lb.feedback(info)
    }

    pub fn weight(&self) -> i32 {
        self.lb.weight()
    }

    pub fn describe(&self) -> String {
        self.description.clone()
    }
}

impl Drop for LoadBalancerWithNaming {
    fn drop(&mut self) {
        for (ep, _) in self.servers().drain(..) {
            socket_map::remove(ep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::loopback;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FirstServer {
        servers: Mutex<Vec<SocketId>>,
        feedbacks: AtomicUsize,
    }

    impl FirstServer {
        fn new() -> Arc<dyn LoadBalancer> {
            Arc::new(Self {
                servers: Mutex::new(Vec::new()),
                feedbacks: AtomicUsize::new(0),
            })
        }
    }

    impl LoadBalancer for FirstServer {
        fn select_server(&self, input: &SelectIn<'_>) -> Result<SelectOut, ErrorCode> {
            let servers = self.servers.lock().unwrap();
            servers
                .iter()
                .copied()
                .find(|id| !input.excluded.contains(id))
                .map(|socket| SelectOut {
                    socket,
                    need_feedback: true,
                })
                .ok_or(ErrorCode::NoServer)
        }

        fn feedback(&self, _info: &CallInfo) {
            self.feedbacks.fetch_add(1, Ordering::SeqCst);
        }

        fn reset_servers(&self, servers: &[SocketId]) {
            *self.servers.lock().unwrap() = servers.to_vec();
        }

        fn describe(&self) -> String {
            "first".to_string()
        }
    }

    fn register_first() {
        register_load_balancer("first", FirstServer::new);
    }

    #[test]
    fn list_naming_parses_endpoints() {
        let ns = ListNamingService;
        let servers = ns.get_servers("127.0.0.1:2001, 127.0.0.1:2002,").unwrap();
        assert_eq!(servers, vec![loopback(2001), loopback(2002)]);
        assert!(ns.get_servers("127.0.0.1:2001,bogus").is_err());
        assert_eq!(ns.get_servers("").unwrap(), Vec::new());
    }

    #[test]
    fn init_interns_servers_and_drop_releases_them() {
        crate::global::global_initialize_or_die();
        register_first();
        let opts = NamingServiceOptions {
            succeed_without_server: true,
            log_succeed_without_server: false,
        };
        let lbwn = LoadBalancerWithNaming::init(
            "list://127.0.0.1:2011,127.0.0.1:2012",
            "first",
            None,
            &opts,
        )
        .unwrap();
        assert_eq!(socket_map::ref_count(loopback(2011)), 1);
        assert_eq!(socket_map::ref_count(loopback(2012)), 1);

        let out = lbwn
            .select_server(&SelectIn {
                begin_time_us: 0,
                request_code: None,
                excluded: &[],
            })
            .unwrap();
        assert!(out.need_feedback);

        drop(lbwn);
        assert_eq!(socket_map::ref_count(loopback(2011)), 0);
        assert_eq!(socket_map::ref_count(loopback(2012)), 0);
    }

    #[test]
    fn empty_server_set_honors_tolerance() {
        crate::global::global_initialize_or_die();
        register_first();
        let strict = NamingServiceOptions {
            succeed_without_server: false,
            log_succeed_without_server: false,
        };
        let err = LoadBalancerWithNaming::init("list://", "first", None, &strict).unwrap_err();
        assert!(matches!(err, InitError::NamingFailed(_)));

        let tolerant = NamingServiceOptions {
            succeed_without_server: true,
            log_succeed_without_server: false,
        };
        let lbwn = LoadBalancerWithNaming::init("list://", "first", None, &tolerant).unwrap();
        assert!(matches!(
            lbwn.select_server(&SelectIn {
                begin_time_us: 0,
                request_code: None,
                excluded: &[],
            }),
            Err(ErrorCode::NoServer)
        ));
    }

    #[test]
    fn filter_prunes_servers() {
        crate::global::global_initialize_or_die();
        register_first();
        struct OddPorts;
        impl ServerFilter for OddPorts {
            fn accept(&self, server: &Endpoint) -> bool {
                server.port() % 2 == 1
            }
        }
        let opts = NamingServiceOptions {
            succeed_without_server: true,
            log_succeed_without_server: false,
        };
        let lbwn = LoadBalancerWithNaming::init(
            "list://127.0.0.1:2021,127.0.0.1:2022",
            "first",
            Some(Arc::new(OddPorts)),
            &opts,
        )
        .unwrap();
        assert_eq!(socket_map::ref_count(loopback(2021)), 1);
        assert_eq!(socket_map::ref_count(loopback(2022)), 0);
        drop(lbwn);
    }

    #[test]
    fn unknown_scheme_and_balancer_fail() {
        crate::global::global_initialize_or_die();
        register_first();
        let opts = NamingServiceOptions {
            succeed_without_server: true,
            log_succeed_without_server: false,
        };
        assert!(matches!(
            LoadBalancerWithNaming::init("zk://x", "first", None, &opts),
            Err(InitError::NamingFailed(_))
        ));
        assert!(matches!(
            LoadBalancerWithNaming::init("list://", "nonexistent", None, &opts),
            Err(InitError::BalancerUnknown(_))
        ));
    }
}
