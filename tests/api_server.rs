//! The REST API served on a Unix socket, backed by a live builtin port
//! driver. The client side is a plain HTTP/1.1 exchange over the socket.

use rootlesskit::{
    api::{self, server::Backend},
    port::{builtin, ChildContext, ChildDriver as _, ParentDriver as _},
    quit,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    runtime::Runtime,
    sync::{oneshot, watch},
    time::{sleep, timeout},
};

struct ApiHarness {
    sock_path: PathBuf,
    quit_tx: watch::Sender<bool>,
    child_thread: std::thread::JoinHandle<()>,
}

async fn start(state_dir: &std::path::Path) -> ApiHarness {
    let _ = env_logger::builder().is_test(true).try_init();
    let driver = Arc::new(builtin::parent::Driver::new(state_dir).unwrap());
    let (quit_tx, quit_rx) = quit::channel();
    let (init_tx, init_rx) = oneshot::channel();

    let opaque = driver.opaque_for_child();
    let run_driver = driver.clone();
    let run_quit = quit_rx.clone();
    tokio::spawn(async move {
        run_driver
            .run_parent_driver(init_tx, run_quit, ChildContext::default())
            .await
    });
    let ctrl_path = PathBuf::from(opaque.get(builtin::OPAQUE_SOCK_PATH).unwrap());
    timeout(Duration::from_secs(5), async {
        while !ctrl_path.exists() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("control socket never appeared");
    let child_quit = quit_rx.clone();
    let child_thread = std::thread::spawn(move || {
        let child = builtin::child::Driver::new();
        let _ = child.run_child_driver(opaque, child_quit, None);
    });
    timeout(Duration::from_secs(5), init_rx)
        .await
        .expect("driver never became ready")
        .unwrap();

    let sock_path = state_dir.join("api.sock");
    let listener = UnixListener::bind(&sock_path).unwrap();
    let backend = Arc::new(Backend {
        state_dir: state_dir.to_path_buf(),
        child_pid: 12345,
        network_driver_info: None,
        port_driver: Some(driver),
    });
    tokio::spawn(api::server::serve(listener, backend, quit_rx));

    ApiHarness {
        sock_path,
        quit_tx,
        child_thread,
    }
}

impl ApiHarness {
    async fn stop(self) {
        let _ = self.quit_tx.send(true);
        let _ = self.child_thread.join();
    }

    async fn request(&self, method: &str, path: &str, body: Option<&str>) -> (u16, String) {
        let mut stream = UnixStream::connect(&self.sock_path).await.unwrap();
        let body = body.unwrap_or("");
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
            .await
            .expect("api response timed out")
            .unwrap();
        let raw = String::from_utf8(raw).unwrap();
        let status: u16 = raw
            .split_whitespace()
            .nth(1)
            .expect("no status line")
            .parse()
            .unwrap();
        let body = raw
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (status, body)
    }
}

#[test]
fn info() {
    Runtime::new().unwrap().block_on(async {
        let tmp = tempfile::tempdir().unwrap();
        let harness = start(tmp.path()).await;

        let (status, body) = harness.request("GET", "/v1/info", None).await;
        assert_eq!(status, 200);
        let info: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(info["apiVersion"], api::API_VERSION);
        assert_eq!(info["childPID"], 12345);
        assert_eq!(info["portDriver"]["driver"], "builtin");

        harness.stop().await;
    });
}

#[test]
fn ports_lifecycle() {
    Runtime::new().unwrap().block_on(async {
        let tmp = tempfile::tempdir().unwrap();
        let harness = start(tmp.path()).await;

        let (status, body) = harness
            .request(
                "POST",
                "/v1/ports",
                Some(r#"{"proto":"tcp","parentIP":"127.0.0.1","parentPort":28181,"childPort":81}"#),
            )
            .await;
        assert_eq!(status, 200, "body: {}", body);
        let created: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(created["id"], 1);
        assert_eq!(created["spec"]["parentPort"], 28181);

        let (status, body) = harness.request("GET", "/v1/ports", None).await;
        assert_eq!(status, 200);
        let listed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        // conflicting spec: empty parent IP overlaps 127.0.0.1
        let (status, _) = harness
            .request(
                "POST",
                "/v1/ports",
                Some(r#"{"proto":"tcp","parentPort":28181,"childPort":82}"#),
            )
            .await;
        assert_eq!(status, 409);

        let (status, _) = harness.request("DELETE", "/v1/ports/1", None).await;
        assert_eq!(status, 204);

        let (status, body) = harness.request("GET", "/v1/ports", None).await;
        assert_eq!(status, 200);
        let listed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 0);

        let (status, _) = harness.request("DELETE", "/v1/ports/1", None).await;
        assert_eq!(status, 404);

        harness.stop().await;
    });
}

#[test]
fn bad_requests() {
    Runtime::new().unwrap().block_on(async {
        let tmp = tempfile::tempdir().unwrap();
        let harness = start(tmp.path()).await;

        let (status, _) = harness.request("GET", "/v1/nonsense", None).await;
        assert_eq!(status, 404);

        let (status, _) = harness
            .request("POST", "/v1/ports", Some("this is not json"))
            .await;
        assert_eq!(status, 400);

        // port 0 is out of range
        let (status, _) = harness
            .request(
                "POST",
                "/v1/ports",
                Some(r#"{"proto":"tcp","parentPort":0,"childPort":81}"#),
            )
            .await;
        assert_eq!(status, 400);

        let (status, _) = harness.request("DELETE", "/v1/ports/not-a-number", None).await;
        assert_eq!(status, 400);

        harness.stop().await;
    });
}
