//! The builtin port driver, both halves in one process: the parent half
//! binds real host sockets and the child half connects back over the
//! control socket, so the whole SCM_RIGHTS data plane runs for real.

use rootlesskit::{
    errors::PortError,
    port::{
        builtin,
        portutil::parse_port_spec,
        ChildContext, ChildDriver as _, ParentDriver as _, PortSpec,
    },
    quit,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    runtime::Runtime,
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};

struct Harness {
    driver: Arc<builtin::parent::Driver>,
    quit_tx: watch::Sender<bool>,
    driver_task: JoinHandle<Result<(), PortError>>,
    child_thread: std::thread::JoinHandle<()>,
}

async fn start(state_dir: &Path) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let driver = Arc::new(builtin::parent::Driver::new(state_dir).unwrap());
    let (quit_tx, quit_rx) = quit::channel();
    let (init_tx, init_rx) = oneshot::channel();

    let opaque = driver.opaque_for_child();
    let run_driver = driver.clone();
    let run_quit = quit_rx.clone();
    let driver_task = tokio::spawn(async move {
        run_driver
            .run_parent_driver(init_tx, run_quit, ChildContext::default())
            .await
    });

    // The parent half owns the listening socket; wait for it before the
    // child half dials in.
    let sock_path = PathBuf::from(opaque.get(builtin::OPAQUE_SOCK_PATH).unwrap());
    timeout(Duration::from_secs(5), async {
        while !sock_path.exists() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("control socket never appeared");

    let child_quit = quit_rx.clone();
    let child_thread = std::thread::spawn(move || {
        let child = builtin::child::Driver::new();
        if let Err(err) = child.run_child_driver(opaque, child_quit, None) {
            panic!("child driver failed: {}", err);
        }
    });

    timeout(Duration::from_secs(5), init_rx)
        .await
        .expect("driver never became ready")
        .expect("driver dropped the init signal");

    Harness {
        driver,
        quit_tx,
        driver_task,
        child_thread,
    }
}

impl Harness {
    async fn stop(self) {
        let _ = self.quit_tx.send(true);
        self.driver_task
            .await
            .expect("driver task panicked")
            .expect("driver returned an error");
        self.child_thread.join().expect("child thread panicked");
    }
}

fn spec(s: &str) -> PortSpec {
    parse_port_spec(s).unwrap()
}

#[test]
fn add_list_remove() {
    Runtime::new().unwrap().block_on(async {
        let tmp = tempfile::tempdir().unwrap();
        let harness = start(tmp.path()).await;
        let driver = harness.driver.clone();

        let first = driver
            .add_port(spec("127.0.0.1:28080:80/tcp"))
            .await
            .unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.spec, spec("127.0.0.1:28080:80/tcp"));

        let second = driver
            .add_port(spec("127.0.0.1:28081:81/tcp"))
            .await
            .unwrap();
        assert!(second.id > first.id);

        let listed = driver.list_ports().await;
        assert_eq!(listed, vec![first.clone(), second.clone()]);

        driver.remove_port(first.id).await.unwrap();
        assert_eq!(driver.list_ports().await, vec![second]);

        let err = driver.remove_port(first.id).await.unwrap_err();
        assert!(matches!(err, PortError::NotFound(_)));

        harness.stop().await;
    });
}

#[test]
fn conflicting_add_rejected() {
    Runtime::new().unwrap().block_on(async {
        let tmp = tempfile::tempdir().unwrap();
        let harness = start(tmp.path()).await;
        let driver = harness.driver.clone();

        driver
            .add_port(spec("127.0.0.1:29000:90/tcp"))
            .await
            .unwrap();
        // Empty parent IP overlaps 127.0.0.1 in the same family.
        let err = driver.add_port(spec(":29000:91/tcp")).await.unwrap_err();
        assert!(matches!(err, PortError::Conflict { .. }));
        // A different transport on the same port is fine.
        driver
            .add_port(spec("127.0.0.1:29000:90/udp"))
            .await
            .unwrap();

        harness.stop().await;
    });
}

#[test]
fn tcp_round_trip() {
    const BANNER: &[u8] = b"greetings from the inside\n";
    Runtime::new().unwrap().block_on(async {
        let tmp = tempfile::tempdir().unwrap();
        let harness = start(tmp.path()).await;

        // Stands in for a service inside the child namespace.
        let service = TcpListener::bind("127.0.0.1:28090").await.unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = service.accept().await {
                let _ = stream.write_all(BANNER).await;
            }
        });

        harness
            .driver
            .add_port(spec("127.0.0.1:28085:28090/tcp"))
            .await
            .unwrap();

        let mut conn = TcpStream::connect("127.0.0.1:28085").await.unwrap();
        let mut banner = Vec::new();
        timeout(Duration::from_secs(5), conn.read_to_end(&mut banner))
            .await
            .expect("forwarded read timed out")
            .unwrap();
        assert_eq!(banner, BANNER);

        harness.stop().await;
    });
}

#[test]
fn tcp_bidirectional_copy() {
    Runtime::new().unwrap().block_on(async {
        let tmp = tempfile::tempdir().unwrap();
        let harness = start(tmp.path()).await;

        // Echo service; EOF from the peer half-closes its write side.
        let service = TcpListener::bind("127.0.0.1:28091").await.unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = service.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });

        harness
            .driver
            .add_port(spec("127.0.0.1:28086:28091/tcp"))
            .await
            .unwrap();

        let mut conn = TcpStream::connect("127.0.0.1:28086").await.unwrap();
        conn.write_all(b"ping over the boundary").await.unwrap();
        conn.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        timeout(Duration::from_secs(5), conn.read_to_end(&mut echoed))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(echoed, b"ping over the boundary");

        harness.stop().await;
    });
}

#[test]
fn removed_port_refuses_connections() {
    Runtime::new().unwrap().block_on(async {
        let tmp = tempfile::tempdir().unwrap();
        let harness = start(tmp.path()).await;
        let driver = harness.driver.clone();

        let status = driver
            .add_port(spec("127.0.0.1:28087:28092/tcp"))
            .await
            .unwrap();
        TcpStream::connect("127.0.0.1:28087").await.unwrap();

        driver.remove_port(status.id).await.unwrap();
        assert!(TcpStream::connect("127.0.0.1:28087").await.is_err());

        harness.stop().await;
    });
}

#[test]
fn udp_echo() {
    Runtime::new().unwrap().block_on(async {
        let tmp = tempfile::tempdir().unwrap();
        let harness = start(tmp.path()).await;

        let echo = UdpSocket::bind("127.0.0.1:29590").await.unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            while let Ok((len, peer)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..len], peer).await;
            }
        });

        harness
            .driver
            .add_port(spec("127.0.0.1:29500:29590/udp"))
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"anybody in there?", "127.0.0.1:29500")
            .await
            .unwrap();
        let mut buf = vec![0u8; 65536];
        let (len, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("udp reply timed out")
            .unwrap();
        assert_eq!(&buf[..len], b"anybody in there?");
        assert_eq!(from, "127.0.0.1:29500".parse().unwrap());

        harness.stop().await;
    });
}

#[test]
fn wildcard_binds_both_families_when_permitted() {
    Runtime::new().unwrap().block_on(async {
        let tmp = tempfile::tempdir().unwrap();
        let harness = start(tmp.path()).await;

        let service = TcpListener::bind("127.0.0.1:28093").await.unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = service.accept().await {
                let _ = stream.write_all(b"dual").await;
            }
        });

        harness
            .driver
            .add_port(spec("28088:28093/tcp"))
            .await
            .unwrap();

        let mut conn = TcpStream::connect("127.0.0.1:28088").await.unwrap();
        let mut body = Vec::new();
        timeout(Duration::from_secs(5), conn.read_to_end(&mut body))
            .await
            .expect("v4 read timed out")
            .unwrap();
        assert_eq!(body, b"dual");

        harness.stop().await;
    });
}
