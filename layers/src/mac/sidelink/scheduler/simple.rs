//! Simple Sidelink Scheduler
//!
//! One logical channel per destination, dynamic grants only. The initial
//! transmission and its retransmissions are drawn at random inside a
//! retransmission window.

use crate::LayerError;
use common::SfnSf;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use super::grant::{build_slot_allocations, GrantLifecycleManager};
use super::{AllocationInfo, DstInfoMap, NrSlUeMacScheduler, SchedulerConfig, SchedulerMac};
use crate::mac::sidelink::amc::{NrSlAmc, MAX_MCS};
use crate::mac::sidelink::lcg::SlDestinationInfo;
use crate::mac::sidelink::phy_mac_common::{
    NrSlReportBufferStatus, NrSlTransmissionParams, SidelinkLogicalChannelInfo, SlResourceInfo, SlRlcPduInfo,
};
use crate::mac::sidelink::resource_pool::{PSSCH_SYMBOLS, PSSCH_SYMBOLS_WITH_PSFCH};

/// SCI stage 2 overhead in bytes
const SCI_2_OVERHEAD_BYTES: u32 = 8;

pub struct NrSlUeMacSchedulerSimple {
    config: SchedulerConfig,
    dsts: DstInfoMap,
    grants: GrantLifecycleManager,
    amc: NrSlAmc,
    rng: StdRng,
}

impl NrSlUeMacSchedulerSimple {
    pub fn new(config: SchedulerConfig, seed: u64) -> Result<Self, LayerError> {
        if config.mcs > MAX_MCS {
            return Err(LayerError::InvalidConfiguration(format!(
                "MCS {} above maximum {}",
                config.mcs, MAX_MCS
            )));
        }
        if config.re_tx_window < 2 {
            return Err(LayerError::InvalidConfiguration(format!(
                "Retransmission window {} shorter than 2 slots",
                config.re_tx_window
            )));
        }
        Ok(Self {
            dsts: DstInfoMap::new(config.mcs),
            grants: GrantLifecycleManager::new(),
            amc: NrSlAmc::new(),
            rng: StdRng::seed_from_u64(seed),
            config,
        })
    }

    /// Random slot indices of the initial transmission and its
    /// retransmissions among `n` slots, each transmission 1-indexed
    fn randomly_select_slots(&mut self, n: usize, max_num_per_reserve: usize) -> Vec<usize> {
        let total_re_tx = max_num_per_reserve.clamp(1, 3).min(n) - 1;
        let first = self.rng.gen_range(1..=n - total_re_tx);
        let mut selected = vec![first - 1];
        if total_re_tx == 0 {
            return selected;
        }
        let window = (self.config.re_tx_window as usize).min(n - first);
        let last_for_re_tx1 = window - total_re_tx + 1 + first;
        let re_tx1 = self.rng.gen_range(first + 1..=last_for_re_tx1);
        selected.push(re_tx1 - 1);
        if total_re_tx == 1 {
            return selected;
        }
        let re_tx2 = self.rng.gen_range(re_tx1 + 1..=first + window);
        selected.push(re_tx2 - 1);
        selected
    }

    fn schedule_dst(&mut self, sfn: &SfnSf, dst_l2_id: u32, mac: &mut dyn SchedulerMac) -> Result<(), LayerError> {
        let Some(lc) = self
            .dsts
            .get(dst_l2_id)
            .and_then(|dst| dst.lcgs().values().next())
            .and_then(|lcg| lcg.lcs().next())
            .cloned()
        else {
            return Ok(());
        };
        let buffer_size = lc.total_queue_size();
        if buffer_size == 0 || self.grants.grants_of(dst_l2_id).iter().any(|g| g.covers_lc(lc.id)) {
            return Ok(());
        }
        let mcs = self.dsts.get(dst_l2_id).map_or(self.config.mcs, SlDestinationInfo::mcs);

        let symbols = u32::from(if mac.psfch_period() > 0 { PSSCH_SYMBOLS_WITH_PSFCH } else { PSSCH_SYMBOLS });
        let subchannel_size = mac.subchannel_size() as u32;
        let total_subchannels = mac.total_subchannels();
        let mut l_subch = 0u16;
        let tb = loop {
            l_subch += 1;
            let tb = self.amc.calculate_tb_size(mcs, 1, subchannel_size * l_subch as u32 * symbols)?;
            if tb >= buffer_size || l_subch >= total_subchannels {
                break tb;
            }
        };
        let tb_size = tb.saturating_sub(SCI_2_OVERHEAD_BYTES);
        if tb_size == 0 {
            warn!("TB of {} bytes too small for destination {}", tb, dst_l2_id);
            return Ok(());
        }

        let params = NrSlTransmissionParams {
            priority: lc.priority,
            pdb_ms: lc.pdb_ms,
            l_subch,
            rri_ms: 0,
            c_resel: 0,
        };
        let offered = mac.candidate_resources(sfn, &params)?;
        let filtered = self.grants.filter_tx_opportunities(
            sfn,
            offered,
            0,
            0,
            self.config.allow_multiple_destinations_per_slot,
            &*mac,
        );
        let mut slots: Vec<SlResourceInfo> = Vec::with_capacity(filtered.len());
        for candidate in filtered {
            if !slots.iter().any(|s| s.same_slot(&candidate)) {
                slots.push(candidate);
            }
        }
        SlResourceInfo::sort_by_slot(&mut slots);
        let Some(max_num_per_reserve) = slots.first().map(|s| s.sl_max_num_per_reserve as usize) else {
            debug!("No resources for destination {}", dst_l2_id);
            return Ok(());
        };

        let indices = self.randomly_select_slots(slots.len(), max_num_per_reserve);
        let selected: Vec<SlResourceInfo> = indices.iter().map(|i| slots[*i].clone()).collect();
        debug!("Destination {} selected slot indices {:?} of {}", dst_l2_id, indices, slots.len());

        let allocation = AllocationInfo {
            priority: lc.priority,
            is_dynamic: true,
            harq_enabled: lc.harq_enabled,
            tb_size,
            allocated_rlc_pdus: vec![SlRlcPduInfo::new(lc.id, tb_size)],
            cast_type: lc.cast_type,
            ..Default::default()
        };
        let dst = self.dsts.get(dst_l2_id).ok_or(LayerError::UnknownDestination(dst_l2_id))?;
        let allocations = build_slot_allocations(&selected, dst, &allocation);
        self.grants.create_grant(sfn, dst_l2_id, allocations, &allocation, mac)?;
        Ok(())
    }
}

impl NrSlUeMacScheduler for NrSlUeMacSchedulerSimple {
    fn csched_lc_config_req(&mut self, params: &SidelinkLogicalChannelInfo) -> Result<(), LayerError> {
        if let Some(dst) = self.dsts.get(params.dst_l2_id) {
            if dst.num_of_lc() > 0 {
                return Err(LayerError::ConfigurationError(format!(
                    "Simple scheduler handles one LC per destination, {} already has {}",
                    params.dst_l2_id,
                    dst.num_of_lc()
                )));
            }
        }
        self.dsts.configure_lc(params)
    }

    fn remove_lc_config_req(&mut self, lcid: u8, dst_l2_id: u32) {
        self.dsts.remove_lc(lcid, dst_l2_id);
    }

    fn sched_rlc_buffer_req(&mut self, params: &NrSlReportBufferStatus) -> Result<(), LayerError> {
        self.dsts.update_buffer(params)
    }

    fn sched_trigger_req(&mut self, sfn: &SfnSf, mac: &mut dyn SchedulerMac) -> Result<(), LayerError> {
        if mac.harq().num_available_total() > 0 {
            let dsts: Vec<u32> = self.dsts.iter().map(|(id, _)| *id).collect();
            for dst_l2_id in dsts {
                self.schedule_dst(sfn, dst_l2_id, mac)?;
            }
        }
        self.grants.publish(sfn, mac)
    }

    fn notify_pdu_dequeue(&mut self, dst_l2_id: u32, lcid: u8, size: u32) -> Result<(), LayerError> {
        self.dsts.assigned_data(dst_l2_id, lcid, size)
    }

    fn assign_streams(&mut self, seed: u64) -> u64 {
        self.rng = StdRng::seed_from_u64(seed);
        1
    }

    fn dst_info(&self, dst_l2_id: u32) -> Option<&SlDestinationInfo> {
        self.dsts.get(dst_l2_id)
    }

    fn grants(&self) -> &GrantLifecycleManager {
        &self.grants
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::mac::sidelink::resource_pool::SlPoolConfig;

    fn scheduler() -> NrSlUeMacSchedulerSimple {
        NrSlUeMacSchedulerSimple::new(SchedulerConfig::default(), 9).unwrap()
    }

    #[test]
    fn test_one_lc_per_destination() {
        let mut sched = scheduler();
        sched.csched_lc_config_req(&lc_info(10, 4, 1, true, 0)).unwrap();
        assert!(matches!(
            sched.csched_lc_config_req(&lc_info(10, 5, 1, true, 0)),
            Err(LayerError::ConfigurationError(_))
        ));
        sched.csched_lc_config_req(&lc_info(20, 5, 1, true, 0)).unwrap();
    }

    #[test]
    fn test_invalid_window() {
        let config = SchedulerConfig { re_tx_window: 1, ..Default::default() };
        assert!(NrSlUeMacSchedulerSimple::new(config, 1).is_err());
    }

    #[test]
    fn test_slot_selection_within_window() {
        let mut sched = NrSlUeMacSchedulerSimple::new(SchedulerConfig { re_tx_window: 5, ..Default::default() }, 3)
            .unwrap();
        for _ in 0..200 {
            let indices = sched.randomly_select_slots(20, 3);
            assert_eq!(indices.len(), 3);
            assert!(indices[0] < indices[1] && indices[1] < indices[2]);
            assert!(indices[2] - indices[0] <= 5);
            assert!(indices[2] < 20);
        }
        assert_eq!(sched.randomly_select_slots(1, 3), vec![0]);
        assert_eq!(sched.randomly_select_slots(4, 1).len(), 1);
    }

    #[test]
    fn test_grant_with_retransmissions() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(10).unwrap();
        mac.t1 = 100;
        let slots: Vec<u64> = (102..112).collect();
        mac.offer_slots(&slots, 1);
        let mut sched = scheduler();
        sched.csched_lc_config_req(&lc_info(10, 4, 1, true, 0)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 4, 100)).unwrap();

        let now = SfnSf::from_normalized(100, 0).unwrap();
        sched.sched_trigger_req(&now, &mut mac).unwrap();
        assert_eq!(mac.published.len(), 1);
        let grant = &mac.published[0].1;
        assert_eq!(grant.slot_allocations.len(), 3);
        let expected = NrSlAmc::new().calculate_tb_size(14, 1, 10 * 12).unwrap() - 8;
        assert_eq!(grant.tb_size, expected);
        let ndis: Vec<u8> = grant.slot_allocations.iter().map(|s| s.ndi).collect();
        assert_eq!(ndis, vec![1, 0, 0]);
        assert!(grant.slot_allocations.iter().all(|s| s.sl_pssch_subch_start == 0));

        sched.notify_pdu_dequeue(10, 4, 100).unwrap();
        assert_eq!(sched.dst_info(10).unwrap().lcg_of(4).unwrap().total_size(), 0);
        sched.sched_trigger_req(&SfnSf::from_normalized(101, 0).unwrap(), &mut mac).unwrap();
        assert_eq!(mac.published.len(), 1);
        assert_eq!(mac.requests.len(), 1);
    }
}
