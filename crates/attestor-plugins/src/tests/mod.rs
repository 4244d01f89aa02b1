//! Crate-level end-to-end tests.
//!
//! These exercise the full path a core service takes: a category trait
//! with its own RPC method, a channel wrapping it, discovery through a
//! [`Manager`], and live calls into scripted plugin subprocess stand-ins.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::channel::{RpcChannel, ServiceDispatcher};
use crate::connection::RpcClient;
use crate::contract::{MediaTypeMap, Pluggable, dispatch_base};
use crate::error::PluginError;
use crate::handshake::HandshakeConfig;
use crate::loader::{Loader, LoaderConfig};
use crate::manager::Manager;
use crate::serve::PluginServer;
use crate::testing::InProcessLauncher;

const SERVICE: &str = "echo";
const METHOD_TRANSFORM: &str = "transform";

/// A capability category with one remote method of its own.
trait Echoing: Pluggable {
    fn transform(&self, input: &str) -> Result<String, PluginError>;
}

/// Plugin-side implementation: upper-cases the input, slowly on demand.
struct LocalEcho {
    delay: Duration,
}

impl Echoing for LocalEcho {
    fn transform(&self, input: &str) -> Result<String, PluginError> {
        thread::sleep(self.delay);
        Ok(input.to_uppercase())
    }
}

impl Pluggable for LocalEcho {
    fn name(&self) -> String {
        "echo-plugin".into()
    }

    fn attestation_scheme(&self) -> String {
        "ECHO".into()
    }

    fn supported_media_types(&self) -> MediaTypeMap {
        let mut map = MediaTypeMap::new();
        map.insert("echoing".into(), vec!["text/plain".into()]);
        map
    }

    fn version(&self) -> String {
        "1.0.0".into()
    }
}

struct EchoDispatcher {
    inner: Arc<dyn Echoing>,
}

impl ServiceDispatcher for EchoDispatcher {
    fn dispatch(&self, method: &str, params: Value) -> Result<Value, String> {
        if let Some(result) = dispatch_base(self.inner.as_ref(), method) {
            return Ok(result);
        }
        if method == METHOD_TRANSFORM {
            let input: String =
                serde_json::from_value(params).map_err(|err| format!("bad params: {err}"))?;
            return self
                .inner
                .transform(&input)
                .map(Value::String)
                .map_err(|err| err.to_string());
        }
        Err(format!("unknown method {method:?}"))
    }
}

/// Host-side stub speaking the category's protocol over RPC.
#[derive(Clone)]
struct EchoClient {
    client: RpcClient,
}

impl Pluggable for EchoClient {
    fn name(&self) -> String {
        self.client.call_or_default(crate::contract::METHOD_GET_NAME)
    }

    fn attestation_scheme(&self) -> String {
        self.client
            .call_or_default(crate::contract::METHOD_GET_ATTESTATION_SCHEME)
    }

    fn supported_media_types(&self) -> MediaTypeMap {
        self.client
            .call_or_default(crate::contract::METHOD_GET_SUPPORTED_MEDIA_TYPES)
    }

    fn version(&self) -> String {
        self.client.call_or_default(crate::contract::METHOD_GET_VERSION)
    }
}

impl Echoing for EchoClient {
    fn transform(&self, input: &str) -> Result<String, PluginError> {
        self.client.call(METHOD_TRANSFORM, &input)
    }
}

fn echo_channel() -> RpcChannel<Arc<dyn Echoing>> {
    fn wrap_client(client: RpcClient) -> Arc<dyn Echoing> {
        Arc::new(EchoClient { client })
    }
    fn wrap_server(inner: Arc<dyn Echoing>) -> Box<dyn ServiceDispatcher> {
        Box::new(EchoDispatcher { inner })
    }
    RpcChannel::new(wrap_client, wrap_server)
}

/// A server exposing the echo category with the given method delay.
fn echo_server(delay: Duration) -> PluginServer {
    let mut server = PluginServer::new(HandshakeConfig::default());
    let plugin: Arc<dyn Echoing> = Arc::new(LocalEcho { delay });
    server
        .register(SERVICE, echo_channel(), plugin)
        .expect("register echo service");
    server
}

fn manager_over(
    launcher: &Arc<InProcessLauncher>,
    dir: &tempfile::TempDir,
    timeout_secs: u64,
) -> Result<Manager<Arc<dyn Echoing>>, PluginError> {
    let loader = Loader::with_launcher(
        Arc::clone(launcher) as Arc<dyn crate::process::Launcher>,
        HandshakeConfig::default(),
    );
    let config =
        LoaderConfig::new(dir.path().to_string_lossy()).with_call_timeout_secs(timeout_secs);
    Manager::create_with_loader(loader, &config, SERVICE, echo_channel())
}

fn script_echo_plugin(launcher: &Arc<InProcessLauncher>, dir: &tempfile::TempDir, delay: Duration) {
    let path = dir.path().join("echo.plugin");
    std::fs::write(&path, b"").expect("create plugin file");
    launcher.script(path, Box::new(move || echo_server(delay)));
}

#[test]
fn end_to_end_discovery_and_typed_calls() {
    let launcher = Arc::new(InProcessLauncher::new());
    let dir = tempfile::TempDir::new().expect("plugin directory");
    script_echo_plugin(&launcher, &dir, Duration::ZERO);

    let manager = manager_over(&launcher, &dir, 5).expect("create manager");
    let handle = manager.lookup_by_media_type("text/plain").expect("lookup");

    assert_eq!(handle.name(), "echo-plugin");
    assert_eq!(handle.transform("hello").expect("transform"), "HELLO");
}

#[test]
fn concurrent_calls_multiplex_over_one_connection() {
    let launcher = Arc::new(InProcessLauncher::new());
    let dir = tempfile::TempDir::new().expect("plugin directory");
    script_echo_plugin(&launcher, &dir, Duration::from_millis(50));

    let manager = manager_over(&launcher, &dir, 5).expect("create manager");
    let handle = manager.lookup_by_name("echo-plugin").expect("lookup");

    let workers: Vec<_> = ["alpha", "bravo", "charlie", "delta"]
        .into_iter()
        .map(|input| {
            let worker_handle = Arc::clone(&handle);
            thread::spawn(move || worker_handle.transform(input).expect("transform"))
        })
        .collect();

    let mut results: Vec<String> = workers
        .into_iter()
        .map(|worker| worker.join().expect("worker panicked"))
        .collect();
    results.sort();
    assert_eq!(results, vec!["ALPHA", "BRAVO", "CHARLIE", "DELTA"]);
}

#[test]
fn slow_methods_hit_the_call_deadline() {
    let launcher = Arc::new(InProcessLauncher::new());
    let dir = tempfile::TempDir::new().expect("plugin directory");
    script_echo_plugin(&launcher, &dir, Duration::from_secs(5));

    let manager = manager_over(&launcher, &dir, 1).expect("create manager");
    let handle = manager.lookup_by_name("echo-plugin").expect("lookup");

    let error = handle.transform("never").expect_err("deadline expected");
    assert!(matches!(
        error,
        PluginError::CallTimeout {
            timeout_secs: 1,
            ..
        }
    ));
}

#[test]
fn terminated_plugins_fail_calls_instead_of_hanging() {
    let launcher = Arc::new(InProcessLauncher::new());
    let dir = tempfile::TempDir::new().expect("plugin directory");
    script_echo_plugin(&launcher, &dir, Duration::ZERO);

    let mut manager = manager_over(&launcher, &dir, 5).expect("create manager");
    let handle = manager.lookup_by_name("echo-plugin").expect("lookup");
    manager.close();
    assert!(launcher.wait_idle(Duration::from_secs(2)));

    let error = handle.transform("late").expect_err("connection is gone");
    assert!(matches!(
        error,
        PluginError::Disconnected { .. } | PluginError::Io { .. }
    ));
}
