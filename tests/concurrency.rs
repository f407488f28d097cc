use std::thread;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Instant;
use foa_rc::{RateControl, RateControlError, TxReport, rate_table::RateTableProfile};
use rand_core::RngCore;

struct XorShift(u32);
impl RngCore for XorShift {
    fn next_u32(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }
    fn next_u64(&mut self) -> u64 {
        ((self.next_u32() as u64) << 32) | self.next_u32() as u64
    }
    fn fill_bytes(&mut self, dst: &mut [u8]) {
        dst.iter_mut().for_each(|byte| *byte = self.next_u32() as u8);
    }
}

#[test]
fn reports_ticks_and_teardown_interleave() {
    let engine: RateControl<CriticalSectionRawMutex, XorShift> =
        RateControl::new(RateTableProfile::S1G, XorShift(0x1234_5678));
    engine.add_peer(0, 1).unwrap();
    engine.add_peer(0, 2).unwrap();

    thread::scope(|scope| {
        // Periodic task
        scope.spawn(|| {
            for tick in 1..=500u64 {
                engine.tick(Instant::from_millis(tick * 20));
            }
        });
        // TX completion for a long lived peer
        scope.spawn(|| {
            let mut rng = XorShift(42);
            for _ in 0..5000 {
                let rate_index = engine.get_rate_index(0, 1, 0).unwrap();
                let successes = (rng.next_u32() % 4 != 0) as u16;
                engine
                    .on_tx_report(
                        0,
                        1,
                        TxReport {
                            rate_index,
                            attempts: 1,
                            successes,
                            rssi: Some(-60),
                        },
                    )
                    .unwrap();
            }
        });
        // A peer, that keeps associating and leaving
        scope.spawn(|| {
            for i in 0..2000 {
                match engine.update_stats(0, 2, (i % 9) as u8, 1, 1) {
                    Ok(()) | Err(RateControlError::UnknownPeer) => {}
                    Err(err) => panic!("Unexpected error: {err:?}"),
                }
                if i % 50 == 0 {
                    let _ = engine.remove_peer(0, 2);
                } else if i % 50 == 25 {
                    let _ = engine.add_peer(0, 2);
                }
            }
        });
    });

    engine
        .inspect_peer(0, 1, |node, cursor| {
            assert!(node.rates().iter().any(|rate| rate.total_attempt > 0));
            assert!(
                node.rates()
                    .iter()
                    .all(|rate| rate.total_success <= rate.total_attempt)
            );
            assert!((node.max_throughput_idx() as usize) < node.num_rates());
            assert!(cursor.start_idx() <= cursor.cursor());
            assert!(cursor.cursor() <= cursor.end_idx());
        })
        .unwrap();
}
