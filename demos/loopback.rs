// In demos/loopback.rs
//
// Host and an in-process peer on one region. The host sends hashed
// messages, the peer mirrors every frame back, and the host checks each
// echo against its hash.
//
//   cargo run --example loopback -- 10000 [--control]
use dmxp_hip::HIP::collab::FrameDispatch;
use dmxp_hip::HIP::mif::SoftMif;
use dmxp_hip::HIP::Buffer::QueueId;
use dmxp_hip::HIP::Structs::{Frame, SignalHeader, MA_UNITDATA_REQ, MLME_SET_REQ};
use dmxp_hip::HIP::{PeerEndpoint, TransportBuilder};
use dmxp_hip::{HipError, HipResult};
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn digest(i: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("message_{}", i).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Default)]
struct Verifier {
    good: AtomicUsize,
    bad: AtomicUsize,
}

impl FrameDispatch for Verifier {
    fn dispatch(&self, frame: Frame, _is_control: bool) -> HipResult<()> {
        let payload = frame.payload();
        let text = String::from_utf8_lossy(&payload);
        let ok = match text.split_once(':') {
            Some((n, hash)) => n.parse::<usize>().map(|n| digest(n) == hash).unwrap_or(false),
            None => false,
        };
        if ok {
            self.good.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bad.fetch_add(1, Ordering::Relaxed);
            eprintln!("Loopback: corrupt echo {:?}", text);
        }
        Ok(())
    }
}

/// Send every frame waiting on `q` back to the host, retrying while the
/// to-host side is full.
fn echo(peer: &PeerEndpoint, q: QueueId, alive: &AtomicBool) -> HipResult<usize> {
    let mut n = 0;
    while let Some((frame, refs)) = peer.recv_frame(q)? {
        retry(peer, alive, || peer.return_to_host(&refs))?;
        retry(peer, alive, || peer.send_to_host(&frame, q == QueueId::FhCtrl).map(|_| ()))?;
        n += 1;
    }
    Ok(n)
}

fn retry(peer: &PeerEndpoint, alive: &AtomicBool, mut op: impl FnMut() -> HipResult<()>) -> HipResult<()> {
    loop {
        match op() {
            Err(HipError::NoSpace(_)) if alive.load(Ordering::SeqCst) => {
                peer.reclaim()?;
                thread::yield_now();
            }
            other => return other,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _logger = flexi_logger::Logger::try_with_env_or_str("info")?.start()?;

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <num_frames> [--control]", args[0]);
        std::process::exit(1);
    }
    let num_frames: usize = args[1].parse()?;
    let control = args.get(2).map(|s| s == "--control").unwrap_or(false);

    println!("Loopback: Precomputing {} hashes...", num_frames);
    let messages: Vec<String> = (0..num_frames).map(|i| format!("{}:{}", i, digest(i))).collect();

    let mif = SoftMif::new();
    let verifier = Arc::new(Verifier::default());
    let transport = TransportBuilder::new()
        .with_interrupts(mif.clone())
        .with_dispatch(verifier.clone())
        .build()?;
    let peer = PeerEndpoint::attach(&transport, mif.clone(), 4, 0, 0)?;
    transport.setup()?;

    let keep_alive = Arc::new(AtomicBool::new(true));
    let keep_alive_for_handler = Arc::clone(&keep_alive);
    ctrlc::set_handler(move || {
        keep_alive_for_handler.store(false, Ordering::SeqCst);
    })?;

    let events = mif.fromhost_events();
    let peer_alive = Arc::clone(&keep_alive);
    let peer_thread = thread::spawn(move || -> HipResult<usize> {
        let mut echoed = 0;
        while peer_alive.load(Ordering::SeqCst) {
            // Poll as well, a from-host interrupt can arrive mid-echo
            let _ = events.recv_timeout(Duration::from_millis(5));
            peer.reclaim()?;
            for q in [QueueId::FhCtrl, QueueId::FhDat] {
                echoed += echo(&peer, q, &peer_alive)?;
            }
        }
        Ok(echoed)
    });

    let (signal_id, kind) = if control {
        (MLME_SET_REQ, "control")
    } else {
        (MA_UNITDATA_REQ, "data")
    };
    let signal = SignalHeader {
        id: signal_id,
        ..Default::default()
    }
    .to_bytes()
    .to_vec();

    println!("Loopback: Sending {} {} frames...", num_frames, kind);
    let start = Instant::now();
    let mut sent = 0;
    for message in &messages {
        if !keep_alive.load(Ordering::SeqCst) {
            break;
        }
        loop {
            let frame = Frame::new(signal.clone(), message.as_bytes().to_vec());
            match transport.transmit(frame, control, 0, 0, 0) {
                Ok(()) => {
                    sent += 1;
                    if sent % 1000 == 0 {
                        println!("Sent {} frames", sent);
                    }
                    break;
                }
                Err(HipError::NoSpace(_)) => thread::sleep(Duration::from_micros(10)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while verifier.good.load(Ordering::Relaxed) + verifier.bad.load(Ordering::Relaxed) < sent
        && Instant::now() < deadline
        && keep_alive.load(Ordering::SeqCst)
    {
        thread::sleep(Duration::from_millis(1));
    }
    let elapsed = start.elapsed();

    keep_alive.store(false, Ordering::SeqCst);
    let echoed = match peer_thread.join() {
        Ok(result) => result?,
        Err(_) => return Err("peer thread panicked".into()),
    };

    let good = verifier.good.load(Ordering::Relaxed);
    let bad = verifier.bad.load(Ordering::Relaxed);
    println!(
        "Loopback: sent {}, peer echoed {}, verified {}, corrupt {} in {:.2?} ({:.0} frames/s)",
        sent,
        echoed,
        good,
        bad,
        elapsed,
        good as f64 / elapsed.as_secs_f64()
    );
    println!("{}", transport.dump_state());
    println!("{:?}", transport.stats());

    transport.teardown()?;
    if bad > 0 || good < sent {
        std::process::exit(1);
    }
    Ok(())
}
