use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use flux_sst::{CallbackSet, Listener, LogicalStream, MultiplexedSocket, Reliability, SstConfig};

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

fn connect_pair(
    width: usize,
) -> (Arc<MultiplexedSocket>, Arc<MultiplexedSocket>, Pump, Pump, Pump) {
    let (accepted_tx, accepted_rx) = mpsc::channel::<Arc<MultiplexedSocket>>();

    let mut listener = Listener::bind(
        SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)),
        SstConfig::default().with_width(width),
        move |socket: Arc<MultiplexedSocket>| {
            let _ = accepted_tx.send(socket);
        },
    )
    .expect("listener bind failed");
    let addr = listener.local_addr().expect("local_addr");
    let listener_pump = Pump::start(move || listener.poll());

    let client = MultiplexedSocket::connect(
        addr,
        SstConfig::default().with_width(width),
        |_: LogicalStream| {},
    )
    .expect("client connect failed");
    let client_for_pump = Arc::clone(&client);
    let client_pump = Pump::start(move || client_for_pump.poll());

    let server = accepted_rx.recv_timeout(Duration::from_secs(5)).expect("server never accepted");
    let server_for_pump = Arc::clone(&server);
    let server_pump = Pump::start(move || server_for_pump.poll());

    (client, server, client_pump, server_pump, listener_pump)
}

/// S4: A closes stream 1 while B keeps sending on it. A observes
/// `on_disconnected` for stream 1 exactly once; further B sends toward the
/// now-closed stream are silently dropped at A (no callback, no error).
#[test]
fn local_close_stops_delivery_and_fires_disconnected_once() {
    let (client, server, client_pump, server_pump, listener_pump) = connect_pair(2);

    let disconnected_count = Arc::new(AtomicUsize::new(0));
    let bytes_after_close = Arc::new(AtomicUsize::new(0));
    let disconnected_count_cb = Arc::clone(&disconnected_count);
    let bytes_after_close_cb = Arc::clone(&bytes_after_close);

    let a_stream = client
        .open_stream(Arc::new(CallbackSet::new(
            |_ok| {},
            move |_body: &[u8]| {
                bytes_after_close_cb.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                disconnected_count_cb.fetch_add(1, Ordering::SeqCst);
            },
        )))
        .expect("open_stream failed");
    let a_sid = a_stream.id();

    let (b_stream_tx, b_stream_rx) = mpsc::channel::<LogicalStream>();
    server.set_substream_accept(move |stream: LogicalStream| {
        let _ = b_stream_tx.send(stream);
    });

    // Make sure B has actually bound the peer stream before closing A's side.
    a_stream.send(b"hi".to_vec(), Reliability::OrderedReliable).expect("send failed");
    let b_stream = b_stream_rx.recv_timeout(Duration::from_secs(5)).expect("B never saw NEW_STREAM");
    assert_eq!(b_stream.id(), a_sid);

    a_stream.close();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while disconnected_count.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "on_disconnected never fired");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(disconnected_count.load(Ordering::SeqCst), 1);

    // B keeps sending after A has locally retired the stream; A must not
    // surface any of it and must not error.
    for _ in 0..20 {
        b_stream.send(b"late".to_vec(), Reliability::OrderedReliable).expect("send failed");
    }
    thread::sleep(Duration::from_millis(100));
    assert_eq!(bytes_after_close.load(Ordering::SeqCst), 0);
    assert_eq!(disconnected_count.load(Ordering::SeqCst), 1);

    client_pump.join();
    server_pump.join();
    listener_pump.join();
}

/// S5: an unreliable send past a sub-connection's high-water mark is
/// dropped — no error at the sender, no delivery at the receiver.
#[test]
fn unreliable_send_past_high_water_mark_is_dropped_silently() {
    let (accepted_tx, accepted_rx) = mpsc::channel::<Arc<MultiplexedSocket>>();
    let mut listener = Listener::bind(
        SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)),
        SstConfig::default().with_width(1),
        move |socket: Arc<MultiplexedSocket>| {
            let _ = accepted_tx.send(socket);
        },
    )
    .expect("listener bind failed");
    let addr = listener.local_addr().expect("local_addr");

    // Client never ticks its own poll loop, so nothing ever drains the
    // single sub-connection's outbound backlog: queue depth only grows.
    let client = MultiplexedSocket::connect(
        addr,
        SstConfig::default().with_width(1).with_high_water_mark(0),
        |_: LogicalStream| {},
    )
    .expect("client connect failed");

    let listener_pump = Pump::start(move || listener.poll());
    let _server = accepted_rx.recv_timeout(Duration::from_secs(5)).expect("server never accepted");

    let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let received_cb = Arc::clone(&received);
    let stream = client
        .open_stream(Arc::new(CallbackSet::new(
            |_ok| {},
            move |body: &[u8]| received_cb.lock().unwrap().push(body.to_vec()),
            || {},
        )))
        .expect("open_stream failed");

    // With high_water_mark=0 the first unreliable send already exceeds it
    // (since NEW_STREAM's control frame is already queued ahead of it).
    stream.send(b"dropped".to_vec(), Reliability::UnorderedUnreliable).expect("send failed");

    thread::sleep(Duration::from_millis(100));
    assert!(received.lock().unwrap().is_empty(), "unreliable payload should have been dropped");

    listener_pump.join();
}
