//! Full path tests: HTTP discovery (wiremock), a local websocket echo server
//! standing in for the debugger, tunnels, router and Lua plugins.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cefhost::bootstrap::Host;
use cefhost::discovery::DebuggerClient;
use cefhost::endpoint::probe::PermissiveProbe;
use cefhost::endpoint::{parse_port_parameter, Endpoint, EndpointResolver, VERSION_PATH};
use cefhost::plugins::{PluginEntry, PluginStatus, RuntimeManager, RuntimeOptions};
use cefhost::sink::LogSink;
use cefhost::tunnel::TunnelOptions;
use cefhost::ws::WsTransport;
use cefhost::{Config, MessageBus, TunnelService};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct CollectingSink {
    lines: Mutex<Vec<(String, String)>>,
}

impl CollectingSink {
    fn texts_for(&self, plugin: &str) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == plugin)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

impl LogSink for CollectingSink {
    fn log_plugin_message(&self, plugin: &str, text: &str) {
        self.lines.lock().unwrap().push((plugin.to_string(), text.to_string()));
    }

    fn log_error(&self, plugin: &str, text: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((plugin.to_string(), format!("ERROR {text}")));
    }
}

/// Websocket server that sends every text frame straight back.
async fn start_echo_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_text() && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// Debugger HTTP endpoint advertising `ws_addr`.
async fn start_debugger(ws_addr: SocketAddr) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Browser": "Chrome/126.0.6478.183",
            "Protocol-Version": "1.3",
            "webSocketDebuggerUrl": format!("ws://{ws_addr}/devtools/browser/e2e")
        })))
        .mount(&server)
        .await;
    server
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugin_ping_reaches_subscriber_once() {
    let ws_addr = start_echo_server().await;
    let debugger = start_debugger(ws_addr).await;
    let http_addr = *debugger.address();

    let invocations = tokio::task::spawn_blocking(move || {
        let port_arg = format!("-devtools-port={}", http_addr.port());
        let port = parse_port_parameter(["-silent", port_arg.as_str()]);
        assert_eq!(port, http_addr.port());

        let client = DebuggerClient::new(Endpoint {
            host: http_addr.ip().to_string(),
            port,
            path: VERSION_PATH.to_string(),
        })
        .expect("client");

        let service = TunnelService::new("browser");
        service
            .spawn("browser", WsTransport, TunnelOptions::default(), move || {
                Ok(client.browser_ws_url()?)
            })
            .expect("spawn tunnel");
        assert!(service.wait_until_connected(TIMEOUT), "tunnel never connected");

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        service.bus().subscribe(
            "ping",
            "test",
            Arc::new(move |_: &Value| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let sink = Arc::new(CollectingSink::default());
        let plugins = RuntimeManager::new(service.bus(), sink.clone(), RuntimeOptions::default());
        plugins
            .load(
                "pinger",
                PluginEntry::Source {
                    name: "main.lua".to_string(),
                    code: r#"
                        if tunnel.post_global({ type = "ping" }) then
                            print("sent")
                        end
                    "#
                    .to_string(),
                },
            )
            .expect("load");
        assert_eq!(plugins.wait_until_settled("pinger", TIMEOUT), Some(PluginStatus::Running));
        assert_eq!(sink.texts_for("pinger"), vec!["sent"]);

        assert!(wait_for(|| count.load(Ordering::SeqCst) >= 1), "ping never echoed");
        // No duplicate delivery
        std::thread::sleep(Duration::from_millis(200));

        plugins.unload_all();
        service.shutdown();
        count.load(Ordering::SeqCst)
    })
    .await
    .expect("join");

    assert_eq!(invocations, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_start_loads_plugins_from_directory() {
    let ws_addr = start_echo_server().await;
    let debugger = start_debugger(ws_addr).await;
    let http_addr = *debugger.address();

    let plugins_dir = tempfile::tempdir().expect("tempdir");
    let responder = plugins_dir.path().join("responder");
    std::fs::create_dir_all(&responder).unwrap();
    std::fs::write(
        responder.join("main.lua"),
        r#"
            tunnel.on("ping", function(msg)
                tunnel.post_global({ type = "pong", seq = msg.seq })
            end)
        "#,
    )
    .unwrap();

    let disabled = plugins_dir.path().join("sleeper");
    std::fs::create_dir_all(&disabled).unwrap();
    std::fs::write(disabled.join("plugin.json"), r#"{"name":"sleeper","enabled":false}"#).unwrap();
    std::fs::write(disabled.join("main.lua"), "").unwrap();

    let config = Config {
        debugger_host: http_addr.ip().to_string(),
        plugins_dir: plugins_dir.path().to_path_buf(),
        shared_target_title: None,
        endpoint_wait_secs: 5,
        ..Config::default()
    };

    let pong_seq = tokio::task::spawn_blocking(move || {
        let resolver = EndpointResolver::new(
            vec![format!("-devtools-port={}", http_addr.port())],
            config.debugger_host.clone(),
            config.host_executable.clone(),
            Box::new(PermissiveProbe),
        );
        let host = Host::start_with(&config, &resolver).expect("start");
        assert_eq!(host.endpoint().port, http_addr.port());

        assert_eq!(
            host.plugins().wait_until_settled("responder", TIMEOUT),
            Some(PluginStatus::Running)
        );
        assert_eq!(host.plugins().status("sleeper"), None);

        let seen = Arc::new(Mutex::new(None));
        let recorder = Arc::clone(&seen);
        let bus = host.service().bus();
        bus.subscribe(
            "pong",
            "test",
            Arc::new(move |msg: &Value| {
                *recorder.lock().unwrap() = msg.get("seq").and_then(Value::as_u64);
            }),
        );

        assert!(bus.post_global(&json!({"type": "ping", "seq": 9})));
        assert!(wait_for(|| seen.lock().unwrap().is_some()), "no pong");

        let result = *seen.lock().unwrap();
        host.shutdown();
        result
    })
    .await
    .expect("join");

    assert_eq!(pong_seq, Some(9));
}
