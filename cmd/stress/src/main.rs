//! Scheduler stress: many short fibers, many yields, a recurring timer
//!
//! ```text
//! cargo run --release -p weft-stress -- 100000 4
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use weft::{total_fibers, wprintln, yield_ready, IoManager};

fn main() {
    let mut args = std::env::args().skip(1);
    let fibers: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(100_000);
    let workers: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(4);

    let mgr = IoManager::new(workers, false, "stress").unwrap();
    let done = Arc::new(AtomicU64::new(0));

    let ticks = Arc::new(AtomicU64::new(0));
    let t = ticks.clone();
    let timer = mgr.timers().add_timer(
        100,
        move || {
            t.fetch_add(1, Ordering::Relaxed);
        },
        true,
    );

    let start = Instant::now();
    for _ in 0..fibers {
        let d = done.clone();
        mgr.schedule_fn(move || {
            for _ in 0..4 {
                yield_ready();
            }
            d.fetch_add(1, Ordering::Relaxed);
        });
    }

    while done.load(Ordering::Relaxed) < fibers {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    let elapsed = start.elapsed();

    mgr.timers().cancel(timer);
    mgr.stop();

    wprintln!(
        "{} fibers x 4 yields on {} workers in {:.3}s ({:.0} fibers/s), {} timer ticks, {} fibers alive",
        fibers,
        workers,
        elapsed.as_secs_f64(),
        fibers as f64 / elapsed.as_secs_f64(),
        ticks.load(Ordering::Relaxed),
        total_fibers()
    );
}
