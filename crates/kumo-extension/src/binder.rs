//! Host capabilities exposed to scripts.
//!
//! Every instance is built by [`CapabilityBinder::instance`], which starts
//! from a sandboxed [`RuntimeInstance`] and registers the static modules the
//! extension's kind is allowed to see. Each host function checks its
//! permission before doing anything and raises [`HostError`] on failure.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_channel::bounded;
use parking_lot::RwLock;
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Module};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use crate::config::SandboxConfig;
use crate::descriptor::ExtensionDescriptor;
use crate::exception::HostError;
use crate::naming::{keys_to_host, keys_to_script};
use crate::runtime::RuntimeInstance;

/// Maximum HTTP response body size (10 MB).
const MAX_HTTP_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum log message length from scripts.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Strip control characters (except newline/tab) and truncate.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

// ─── Marshaling ───────────────────────────────────────────────────────

/// Convert a host value to a script value, renaming keys to script case.
pub(crate) fn to_script_value<T: Serialize>(value: &T) -> Result<Dynamic, HostError> {
    let json = serde_json::to_value(value).map_err(|e| HostError::new("marshal", e.to_string()))?;
    rhai::serde::to_dynamic(keys_to_script(json)).map_err(|e| HostError::new("marshal", e.to_string()))
}

/// Convert a script value to JSON in host naming.
pub(crate) fn to_host_json(value: &Dynamic) -> Result<serde_json::Value, HostError> {
    let json: serde_json::Value =
        rhai::serde::from_dynamic(value).map_err(|e| HostError::new("unmarshal", e.to_string()))?;
    Ok(keys_to_host(json))
}

// ─── Plugin store ─────────────────────────────────────────────────────

/// Key/value store shared by every instance of one plugin.
#[derive(Debug, Clone, Default)]
pub struct PluginStore {
    values: Arc<RwLock<HashMap<String, Dynamic>>>,
}

impl PluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Dynamic> {
        self.values.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Dynamic) {
        self.values.write().insert(key.to_string(), value);
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Dynamic> {
        self.values.write().remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── HTTP ─────────────────────────────────────────────────────────────

/// HTTP response returned by `http::get` / `http::post`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Runtime that drives script HTTP requests.
///
/// Scripts run on plain threads and on tokio workers alike, so requests
/// never use the caller's runtime. The runtime lives for the whole process.
static HTTP_RUNTIME: OnceLock<Result<Runtime, String>> = OnceLock::new();

fn http_runtime(function: &str) -> Result<&'static Runtime, HostError> {
    HTTP_RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("kumo-http")
                .enable_all()
                .build()
                .map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| HostError::new(function, format!("http runtime unavailable: {e}")))
}

/// Permission-checked outbound HTTP for one provider.
pub struct HttpAccess {
    extension_id: String,
    http_hosts: Vec<String>,
    timeout: Duration,
    /// Shared HTTP client for connection pooling.
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAccess")
            .field("extension_id", &self.extension_id)
            .field("http_hosts", &self.http_hosts)
            .finish_non_exhaustive()
    }
}

impl HttpAccess {
    pub fn new(extension_id: &str, http_hosts: Vec<String>, timeout_secs: u64) -> Self {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            extension_id: extension_id.to_string(),
            http_hosts,
            timeout,
            client,
        }
    }

    /// Check if a URL's host is in the allowed list (supports glob patterns).
    fn check_http_host(&self, function: &str, url_str: &str) -> Result<(), HostError> {
        if self.http_hosts.is_empty() {
            return Err(HostError::new(
                function,
                format!("extension '{}' has no http_hosts permission", self.extension_id),
            ));
        }

        if self.http_hosts.iter().any(|h| h == "*") {
            return Ok(());
        }

        let url = url::Url::parse(url_str)
            .map_err(|_| HostError::new(function, format!("invalid URL: {url_str}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| HostError::new(function, format!("URL has no host: {url_str}")))?;

        let matches = self.http_hosts.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{suffix}"))
            } else {
                host == pattern
            }
        });

        if !matches {
            return Err(HostError::new(
                function,
                format!(
                    "extension '{}' is not allowed to access host '{host}'; allowed: {:?}",
                    self.extension_id, self.http_hosts
                ),
            ));
        }
        Ok(())
    }

    /// Block requests to private/reserved addresses, even with `*`.
    fn check_private_ip(&self, function: &str, url_str: &str) -> Result<(), HostError> {
        let url = url::Url::parse(url_str)
            .map_err(|_| HostError::new(function, format!("invalid URL: {url_str}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HostError::new(
                function,
                format!("unsupported URL scheme '{}'", url.scheme()),
            ));
        }

        let host = match url.host() {
            Some(h) => h,
            None => return Ok(()),
        };

        let blocked = match host {
            url::Host::Domain(name) => {
                name == "localhost" || name == "metadata.google.internal"
            }
            url::Host::Ipv4(v4) => {
                v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
            }
            url::Host::Ipv6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
        if blocked {
            return Err(HostError::new(
                function,
                format!("HTTP requests to '{host}' are blocked (private/reserved address)"),
            ));
        }
        Ok(())
    }

    pub fn get(&self, url: &str, headers: &HashMap<String, String>) -> Result<HttpResponse, HostError> {
        const FUNCTION: &str = "http::get";
        self.check_http_host(FUNCTION, url)?;
        self.check_private_ip(FUNCTION, url)?;

        let mut req = self.client.get(url);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        self.execute(FUNCTION, req)
    }

    pub fn post(
        &self,
        url: &str,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> Result<HttpResponse, HostError> {
        const FUNCTION: &str = "http::post";
        self.check_http_host(FUNCTION, url)?;
        self.check_private_ip(FUNCTION, url)?;

        let mut req = self.client.post(url).body(body.to_string());
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        self.execute(FUNCTION, req)
    }

    /// Run the request on the HTTP runtime and block the script thread on
    /// the result.
    fn execute(
        &self,
        function: &'static str,
        req: reqwest::RequestBuilder,
    ) -> Result<HttpResponse, HostError> {
        let runtime = http_runtime(function)?;
        let (tx, rx) = bounded(1);
        let extension_id = self.extension_id.clone();
        runtime.spawn(async move {
            let result = match req.send().await {
                Ok(resp) => read_response(&extension_id, function, resp).await,
                Err(e) => Err(HostError::new(function, e.to_string())),
            };
            let _ = tx.send(result);
        });

        // The client timeout fires first; this only guards a lost task.
        rx.recv_timeout(self.timeout + Duration::from_secs(1))
            .map_err(|_| HostError::new(function, "request did not complete"))?
    }
}

async fn read_response(
    extension_id: &str,
    function: &str,
    resp: reqwest::Response,
) -> Result<HttpResponse, HostError> {
    if resp
        .content_length()
        .is_some_and(|len| len as usize > MAX_HTTP_RESPONSE_BYTES)
    {
        return Err(HostError::new(function, "response body too large"));
    }

    let status = resp.status().as_u16();
    let headers: HashMap<String, String> = resp
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let body_bytes = resp
        .bytes()
        .await
        .map_err(|e| HostError::new(function, e.to_string()))?;
    if body_bytes.len() > MAX_HTTP_RESPONSE_BYTES {
        return Err(HostError::new(
            function,
            format!(
                "response body too large: {} bytes (max: {} bytes)",
                body_bytes.len(),
                MAX_HTTP_RESPONSE_BYTES
            ),
        ));
    }

    tracing::debug!(extension = %extension_id, status, bytes = body_bytes.len(), "http response");
    Ok(HttpResponse {
        status,
        headers,
        body: String::from_utf8_lossy(&body_bytes).to_string(),
    })
}

fn header_map(headers: &Map) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ─── Binder ───────────────────────────────────────────────────────────

/// Builds sandboxed instances with the capabilities one extension may use.
#[derive(Debug, Clone)]
pub struct CapabilityBinder {
    descriptor: Arc<ExtensionDescriptor>,
    sandbox: SandboxConfig,
    store: Option<PluginStore>,
    http: Option<Arc<HttpAccess>>,
}

impl CapabilityBinder {
    pub fn new(descriptor: Arc<ExtensionDescriptor>, sandbox: SandboxConfig) -> Self {
        let store = descriptor.is_plugin().then(PluginStore::new);
        let http = (!descriptor.is_plugin()).then(|| {
            Arc::new(HttpAccess::new(
                &descriptor.id,
                descriptor.permissions.http_hosts.clone(),
                sandbox.http_timeout_secs,
            ))
        });
        Self {
            descriptor,
            sandbox,
            store,
            http,
        }
    }

    pub fn descriptor(&self) -> &Arc<ExtensionDescriptor> {
        &self.descriptor
    }

    /// The plugin's shared store; `None` for providers.
    pub fn store(&self) -> Option<&PluginStore> {
        self.store.as_ref()
    }

    /// A fresh instance with every capability bound.
    pub fn instance(&self) -> RuntimeInstance {
        let mut instance = RuntimeInstance::new(&self.descriptor.id, &self.sandbox);
        let engine = instance.engine_mut();
        register_host_error(engine);
        engine.register_static_module("console", console_module(&self.descriptor.id).into());
        engine.register_static_module("util", util_module().into());
        engine.register_static_module("json", json_module().into());
        if let Some(http) = &self.http {
            engine.register_static_module("http", http_module(Arc::clone(http)).into());
        }
        if let Some(store) = &self.store {
            engine.register_static_module("store", store_module(store.clone()).into());
        }
        instance
    }
}

fn register_host_error(engine: &mut Engine) {
    engine
        .register_type_with_name::<HostError>("HostError")
        .register_get("message", |e: &mut HostError| e.message.clone())
        .register_get("function", |e: &mut HostError| e.function.clone())
        .register_fn("to_string", |e: &mut HostError| e.to_string());
}

fn console_module(extension_id: &str) -> Module {
    let mut module = Module::new();
    for level in ["log", "info", "warn", "error", "debug"] {
        let ext = extension_id.to_string();
        module.set_native_fn(level, move |value: Dynamic| -> ScriptResult<()> {
            let message = sanitize_log_message(&value.to_string());
            match level {
                "warn" => tracing::warn!(extension = %ext, "{}", message),
                "error" => tracing::error!(extension = %ext, "{}", message),
                "debug" => tracing::debug!(extension = %ext, "{}", message),
                _ => tracing::info!(extension = %ext, "{}", message),
            }
            Ok(())
        });
    }
    module
}

fn util_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("now", || -> ScriptResult<String> {
        Ok(chrono::Utc::now().to_rfc3339())
    });
    module.set_native_fn("uuid", || -> ScriptResult<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    });
    module
}

fn json_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("parse", |text: ImmutableString| -> ScriptResult<Dynamic> {
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| HostError::new("json::parse", e.to_string()).into_script_error())?;
        rhai::serde::to_dynamic(value)
    });
    module.set_native_fn("stringify", |value: Dynamic| -> ScriptResult<String> {
        let json: serde_json::Value = rhai::serde::from_dynamic(&value)
            .map_err(|e| HostError::new("json::stringify", e.to_string()).into_script_error())?;
        Ok(json.to_string())
    });
    module
}

fn http_module(http: Arc<HttpAccess>) -> Module {
    let mut module = Module::new();

    let access = Arc::clone(&http);
    module.set_native_fn("get", move |url: ImmutableString| -> ScriptResult<Dynamic> {
        let resp = access.get(&url, &HashMap::new()).map_err(HostError::into_script_error)?;
        to_script_value(&resp).map_err(HostError::into_script_error)
    });
    let access = Arc::clone(&http);
    module.set_native_fn(
        "get",
        move |url: ImmutableString, headers: Map| -> ScriptResult<Dynamic> {
            let resp = access
                .get(&url, &header_map(&headers))
                .map_err(HostError::into_script_error)?;
            to_script_value(&resp).map_err(HostError::into_script_error)
        },
    );
    let access = Arc::clone(&http);
    module.set_native_fn(
        "post",
        move |url: ImmutableString, body: ImmutableString| -> ScriptResult<Dynamic> {
            let resp = access
                .post(&url, &body, &HashMap::new())
                .map_err(HostError::into_script_error)?;
            to_script_value(&resp).map_err(HostError::into_script_error)
        },
    );
    module.set_native_fn(
        "post",
        move |url: ImmutableString, body: ImmutableString, headers: Map| -> ScriptResult<Dynamic> {
            let resp = http
                .post(&url, &body, &header_map(&headers))
                .map_err(HostError::into_script_error)?;
            to_script_value(&resp).map_err(HostError::into_script_error)
        },
    );
    module
}

fn store_module(store: PluginStore) -> Module {
    let mut module = Module::new();

    let s = store.clone();
    module.set_native_fn("get", move |key: ImmutableString| -> ScriptResult<Dynamic> {
        Ok(s.get(&key).unwrap_or(Dynamic::UNIT))
    });
    let s = store.clone();
    module.set_native_fn(
        "set",
        move |key: ImmutableString, value: Dynamic| -> ScriptResult<()> {
            s.set(&key, value);
            Ok(())
        },
    );
    let s = store.clone();
    module.set_native_fn("has", move |key: ImmutableString| -> ScriptResult<bool> {
        Ok(s.has(&key))
    });
    let s = store.clone();
    module.set_native_fn("remove", move |key: ImmutableString| -> ScriptResult<Dynamic> {
        Ok(s.remove(&key).unwrap_or(Dynamic::UNIT))
    });
    module.set_native_fn("keys", move || -> ScriptResult<Array> {
        Ok(store.keys().into_iter().map(Dynamic::from).collect())
    });
    module
}
