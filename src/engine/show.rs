//! Human readable dumps of the rate control state.

use core::fmt::{Result, Write};

use super::{VifContext, peer_registry::StaticPeerRegistry};
use crate::{RateControlParameters, rate_table::RateTableProfile};

pub(super) fn write_vif(
    profile: &RateTableProfile,
    vif: usize,
    vif_context: &VifContext,
    peers: &StaticPeerRegistry,
    writer: &mut impl Write,
) -> Result {
    writeln!(
        writer,
        "VIF {}: {} {} MHz, {:?}, {} rates from {}, beacon MCS{}",
        vif,
        profile.name(),
        vif_context.bandwidth.as_mhz(),
        vif_context.state,
        vif_context.window.num_rates,
        vif_context.window.start,
        vif_context.beacon_mcs
    )?;
    for (key, peer) in peers.iter().filter(|(key, _)| key.vif == vif) {
        let node = &peer.node;
        let cursor = &peer.cursor;
        write!(
            writer,
            "AID {}: {:?}, cursor at {}",
            key.aid,
            cursor.state(),
            cursor.current_rate()
        )?;
        if let Some(rssi) = node.rssi_average() {
            write!(writer, ", RSSI {} dBm", rssi)?;
        }
        writeln!(writer, ", {} lookups", node.lookup_count())?;
        writeln!(writer, "   idx mcs   phy     tp   prob   succ/att  total succ/att")?;
        for (index, rate) in node.rates().iter().enumerate() {
            let index = index as u8;
            let mcs = profile
                .entry(node.rate_table_start_index() + index as usize)
                .map(|entry| entry.mcs)
                .unwrap_or_default();
            let mut flags = [b' '; 4];
            for (flag, (marker, marked)) in flags.iter_mut().zip([
                (b'T', node.max_throughput_idx == index),
                (b't', node.second_max_throughput_idx == index),
                (b'P', node.max_probability_idx == index),
                (b'*', cursor.current_rate() == index),
            ]) {
                if marked {
                    *flag = marker;
                }
            }
            writeln!(
                writer,
                "{}{} {:3} {:3} {:5} {:6} {:5.1}% {:5}/{:<5} {:7}/{:<7}",
                if cursor.is_eligible(index) { ' ' } else { '-' },
                core::str::from_utf8(&flags).unwrap_or("    "),
                index,
                mcs,
                rate.phy_rate_kbps(),
                rate.estimated_throughput,
                rate.success_probability * 100.0,
                rate.last_success,
                rate.last_attempt,
                rate.total_success,
                rate.total_attempt
            )?;
        }
    }
    Ok(())
}

pub(super) fn write_parameters(
    parameters: &RateControlParameters,
    writer: &mut impl Write,
) -> Result {
    writeln!(writer, "EWMA level: {}%", parameters.ewma_level)?;
    writeln!(writer, "Update interval: {} ms", parameters.update_interval_ms)?;
    writeln!(writer, "Probe interval: {} ms", parameters.probe_interval_ms)?;
    writeln!(writer, "Promotion threshold: {}", parameters.promotion_threshold)?;
    writeln!(writer, "Demotion threshold: {}", parameters.demotion_threshold)
}
