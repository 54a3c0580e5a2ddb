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

/// Regression for the `NEW_STREAM`/first-data co-arrival race: the
/// `NEW_STREAM` control frame and the first few data frames for the same
/// sid are enqueued on the same sub-connection back-to-back, with no delay
/// letting the accept side install callbacks in between. Both sides must
/// still deliver every byte — nothing dropped on the accept side just
/// because `substream_accept`/`add_callbacks` hadn't run yet when the data
/// frame was decoded.
#[test]
fn data_frame_landing_with_new_stream_in_one_tick_is_not_dropped() {
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
    let listener_pump = Pump::start(move || listener.poll());

    let client =
        MultiplexedSocket::connect(addr, SstConfig::default().with_width(1), |_: LogicalStream| {})
            .expect("client connect failed");
    let client_for_pump = Arc::clone(&client);
    let client_pump = Pump::start(move || client_for_pump.poll());

    let server = accepted_rx.recv_timeout(Duration::from_secs(5)).expect("server never accepted");

    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    let received_cb = Arc::clone(&received);
    let server_for_accept = Arc::clone(&server);
    server.set_substream_accept(move |stream: LogicalStream| {
        let sid = stream.id();
        let received_cb = Arc::clone(&received_cb);
        let cbs = CallbackSet::new(
            |_ok| {},
            move |body: &[u8]| received_cb.lock().unwrap().extend_from_slice(body),
            || {},
        );
        let _ = server_for_accept.add_callbacks(sid, Some(Arc::new(cbs)));
    });

    let stream = client
        .open_stream(Arc::new(CallbackSet::new(|_| {}, |_: &[u8]| {}, || {})))
        .expect("open_stream failed");

    // Fire off several sends immediately after open_stream, with the
    // server's poll loop not started yet: by the time the server starts
    // polling, NEW_STREAM and all of this data are already sitting in its
    // kernel receive buffer and get read (and thus decoded/dispatched)
    // together in a single `poll` tick.
    for i in 0..5u8 {
        stream.send(vec![i], Reliability::OrderedReliable).expect("send failed");
    }
    thread::sleep(Duration::from_millis(50));

    let server_pump = Pump::start(move || server.poll());

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while received.lock().unwrap().len() < 5 {
        assert!(std::time::Instant::now() < deadline, "not all bytes delivered: {:?}", received.lock().unwrap());
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*received.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    client_pump.join();
    server_pump.join();
    listener_pump.join();
}
