use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use flux_sst::{CallbackSet, Listener, LogicalStream, MultiplexedSocket, Reliability, SstConfig};

/// Runs `tick` on a background thread until `stop` is set, then returns a
/// handle to wait on. Mirrors how `flux-network`'s tests drive `poll_with`
/// from a dedicated loop rather than the caller's own stack frame.
struct Pump {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl Pump {
    fn start(mut tick: impl FnMut() + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_for_thread.load(Ordering::Relaxed) {
                tick();
                thread::sleep(Duration::from_millis(1));
            }
        });
        Self { stop, handle }
    }

    fn join(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

fn wait_for<T>(rx: &mpsc::Receiver<T>, timeout: Duration) -> T {
    rx.recv_timeout(timeout).expect("timed out waiting for event")
}

/// S1: peer A connects to B with width 3, opens stream 1, sends "hello"
/// reliable-ordered; B's accept callback fires with sid 1, B's
/// bytes-received fires with "hello".
#[test]
fn client_open_stream_delivers_bytes_to_accepted_peer() {
    let (accepted_tx, accepted_rx) = mpsc::channel::<Arc<MultiplexedSocket>>();
    let (new_stream_tx, new_stream_rx) = mpsc::channel::<u64>();
    let (bytes_tx, bytes_rx) = mpsc::channel::<Vec<u8>>();

    let mut listener = Listener::bind(
        SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)),
        SstConfig::default().with_width(3),
        move |socket: Arc<MultiplexedSocket>| {
            let for_substream = Arc::clone(&socket);
            let new_stream_tx = new_stream_tx.clone();
            let bytes_tx = bytes_tx.clone();
            socket.set_substream_accept(move |stream: LogicalStream| {
                let _ = new_stream_tx.send(stream.id());
                let bytes_tx = bytes_tx.clone();
                let cbs = CallbackSet::new(
                    |_ok| {},
                    move |body: &[u8]| {
                        let _ = bytes_tx.send(body.to_vec());
                    },
                    || {},
                );
                let _ = for_substream.add_callbacks(stream.id(), Some(Arc::new(cbs)));
            });
            let _ = accepted_tx.send(socket);
        },
    )
    .expect("listener bind failed");
    let addr = listener.local_addr().expect("local_addr");

    let listener_pump = Pump::start(move || listener.poll());

    let client = MultiplexedSocket::connect(addr, SstConfig::default().with_width(3), |_stream: LogicalStream| {})
        .expect("client connect failed");
    let client_for_pump = Arc::clone(&client);
    let client_pump = Pump::start(move || client_for_pump.poll());

    let received_connected: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
    let received_connected_cb = Arc::clone(&received_connected);
    let stream1 = client
        .open_stream(Arc::new(CallbackSet::new(
            move |ok| {
                *received_connected_cb.lock().unwrap() = Some(ok);
            },
            |_body: &[u8]| {},
            || {},
        )))
        .expect("open_stream failed");

    let server_socket = wait_for(&accepted_rx, Duration::from_secs(5));
    let server_for_pump = Arc::clone(&server_socket);
    let server_pump = Pump::start(move || server_for_pump.poll());

    stream1.send(b"hello".to_vec(), Reliability::OrderedReliable).expect("send failed");

    let accepted_sid = wait_for(&new_stream_rx, Duration::from_secs(5));
    assert_eq!(accepted_sid, stream1.id());

    let body = wait_for(&bytes_rx, Duration::from_secs(5));
    assert_eq!(body, b"hello".to_vec());
    assert_eq!(*received_connected.lock().unwrap(), Some(true));

    client_pump.join();
    server_pump.join();
    listener_pump.join();
}
