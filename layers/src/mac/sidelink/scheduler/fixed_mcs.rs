//! Fixed MCS Sidelink Scheduler
//!
//! Serves several destinations and several logical channels per destination
//! with one MCS for every destination. Each pass selects the destination
//! with the highest LC priority, groups its LCs sharing the grant
//! attributes of the highest priority LC and sizes a TB for them.

use crate::LayerError;
use common::SfnSf;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::{debug, info, trace};

use super::grant::{
    build_slot_allocations, random_reselection_counter, select_resources_for_blind_retransmissions,
    select_resources_with_constraint, GrantLifecycleManager,
};
use super::{AllocationInfo, DstInfoMap, NrSlUeMacScheduler, SchedulerConfig, SchedulerMac};
use crate::mac::sidelink::amc::{NrSlAmc, MAX_MCS};
use crate::mac::sidelink::lcg::{SlDestinationInfo, SlLogicalChannel};
use crate::mac::sidelink::phy_mac_common::{
    NrSlReportBufferStatus, NrSlTransmissionParams, SidelinkLogicalChannelInfo, SlResourceInfo, SlRlcPduInfo,
};
use crate::mac::sidelink::resource_pool::PSSCH_SYMBOLS_WITH_PSFCH;

/// Bytes of SCI 2-A carried in the TB
const SCI_2A_BYTES: u32 = 5;

/// MAC subheader bytes of one subPDU
const SUBHEADER_BYTES: u32 = 3;

/// Destination, LC set and candidates chosen by logical channel prioritization
#[derive(Debug)]
struct LcpOutcome {
    dst_l2_id: u32,
    allocation: AllocationInfo,
    candidates: Vec<SlResourceInfo>,
}

pub struct NrSlUeMacSchedulerFixedMcs {
    config: SchedulerConfig,
    dsts: DstInfoMap,
    grants: GrantLifecycleManager,
    amc: NrSlAmc,
    /// Random picks among candidate resources
    grant_selection_rng: StdRng,
    /// Tie break among destinations of equal priority
    dst_rng: StdRng,
    /// Re-selection counters and resource keeping
    ue_selected_rng: StdRng,
}

impl NrSlUeMacSchedulerFixedMcs {
    pub fn new(config: SchedulerConfig, seed: u64) -> Result<Self, LayerError> {
        if config.mcs > MAX_MCS {
            return Err(LayerError::InvalidConfiguration(format!(
                "MCS {} above maximum {}",
                config.mcs, MAX_MCS
            )));
        }
        Ok(Self {
            dsts: DstInfoMap::new(config.mcs),
            grants: GrantLifecycleManager::new(),
            amc: NrSlAmc::new(),
            grant_selection_rng: StdRng::seed_from_u64(seed),
            dst_rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
            ue_selected_rng: StdRng::seed_from_u64(seed.wrapping_add(2)),
            config,
        })
    }

    /// LCs of every destination that pass the re-selection check
    fn dsts_and_lcs_needing_scheduling(
        &mut self,
        sfn: &SfnSf,
        mac: &mut dyn SchedulerMac,
    ) -> Result<BTreeMap<u32, Vec<u8>>, LayerError> {
        let mut to_sched = BTreeMap::new();
        for (dst_l2_id, dst) in self.dsts.iter() {
            let mut passed = Vec::new();
            for lc in dst.lcgs().values().flat_map(|lcg| lcg.lcs()) {
                if self
                    .grants
                    .reselection_check(sfn, *dst_l2_id, lc, mac, &mut self.ue_selected_rng)?
                {
                    passed.push(lc.id);
                }
            }
            debug!("Destination {} has {} LCs needing scheduling", dst_l2_id, passed.len());
            if !passed.is_empty() {
                to_sched.insert(*dst_l2_id, passed);
            }
        }
        Ok(to_sched)
    }

    fn logical_channel_prioritization(
        &mut self,
        sfn: &SfnSf,
        to_sched: &BTreeMap<u32, Vec<u8>>,
        mac: &mut dyn SchedulerMac,
    ) -> Result<Option<LcpOutcome>, LayerError> {
        // Destination with the highest LC priority value, random among ties
        let mut dsts_by_prio: BTreeMap<u8, Vec<u32>> = BTreeMap::new();
        for (dst_l2_id, lcids) in to_sched {
            let highest = lcids
                .iter()
                .filter_map(|lcid| self.dsts.lc(*dst_l2_id, *lcid))
                .map(|lc| lc.priority)
                .max();
            if let Some(priority) = highest {
                dsts_by_prio.entry(priority).or_default().push(*dst_l2_id);
            }
        }
        let Some((dst_prio, tied)) = dsts_by_prio.iter().next_back() else {
            return Ok(None);
        };
        let dst_l2_id = tied[self.dst_rng.gen_range(0..tied.len())];
        info!(
            "Selected destination {} ({}/{} destinations with highest LC priority {})",
            dst_l2_id,
            tied.len(),
            to_sched.len(),
            dst_prio
        );
        let dst = self.dsts.get(dst_l2_id).ok_or(LayerError::UnknownDestination(dst_l2_id))?;

        let mut tiers: BTreeMap<u8, Vec<&SlLogicalChannel>> = BTreeMap::new();
        for lcid in to_sched.get(&dst_l2_id).into_iter().flatten() {
            if let Some(lc) = dst.lcg_of(*lcid).and_then(|lcg| lcg.lc(*lcid)) {
                tiers.entry(lc.priority).or_default().push(lc);
            }
        }
        let Some(top) = tiers.values().next_back() else {
            return Ok(None);
        };

        let dynamic = if top.len() > 1 {
            let n_dyn = top.iter().filter(|lc| lc.dynamic).count();
            let n_sps = top.len() - n_dyn;
            let sps = (self.config.priority_to_sps && n_sps > 0)
                || (!self.config.priority_to_sps && n_dyn == 0 && n_sps > 0);
            !sps
        } else {
            top[0].dynamic
        };
        let harq_enabled = top[0].harq_enabled;
        debug!("Selected scheduling type: {}", if dynamic { "dynamic" } else { "SPS" });

        let n_lcs: usize = tiers.values().map(Vec::len).sum();
        for tier in tiers.values_mut() {
            tier.retain(|lc| lc.dynamic == dynamic);
        }
        tiers.retain(|_, tier| !tier.is_empty());
        let Some(reference) = tiers
            .values()
            .next_back()
            .and_then(|tier| tier.iter().min_by_key(|lc| lc.id))
            .copied()
        else {
            return Ok(None);
        };

        let mut allocation = AllocationInfo {
            priority: reference.priority,
            is_dynamic: dynamic,
            harq_enabled,
            cast_type: reference.cast_type,
            ..Default::default()
        };
        if !dynamic {
            for tier in tiers.values_mut() {
                tier.retain(|lc| lc.rri_ms == reference.rri_ms);
            }
            tiers.retain(|_, tier| !tier.is_empty());
            allocation.rri_ms = reference.rri_ms;
            allocation.resel_counter = random_reselection_counter(reference.rri_ms, &mut self.ue_selected_rng)?;
            allocation.c_resel = allocation.resel_counter as u16 * 10;
            debug!(
                "SPS re-selection counters: resel {} cResel {}",
                allocation.resel_counter, allocation.c_resel
            );
        }
        debug!(
            "Attempting {}/{} LCs of destination {}, reference LC {}",
            tiers.values().map(Vec::len).sum::<usize>(),
            n_lcs,
            dst_l2_id,
            reference.id
        );

        // Grow the LC set tier by tier while resources are found for it.
        // The TB is sized for 9 PSSCH symbols, the worst case with PSFCH.
        let subchannel_size = mac.subchannel_size() as u32;
        let total_subchannels = mac.total_subchannels();
        let mut queue: Vec<Vec<&SlLogicalChannel>> = Vec::new();
        let mut buffer_size = 0u32;
        let mut tb_size = 0u32;
        let mut candidates = Vec::new();
        while let Some((_, tier)) = tiers.pop_last() {
            buffer_size += tier.iter().map(|lc| lc.total_queue_size()).sum::<u32>();
            queue.push(tier);

            let mut l_subch = 0u16;
            let tb = loop {
                l_subch += 1;
                let rb_symbols = subchannel_size * l_subch as u32 * PSSCH_SYMBOLS_WITH_PSFCH as u32;
                let tb = self.amc.calculate_tb_size(dst.mcs(), 1, rb_symbols)?;
                if tb >= buffer_size + SCI_2A_BYTES || l_subch >= total_subchannels {
                    break tb;
                }
            };
            trace!(
                "Trying buffer of {} bytes in {} subchannels, TB size {} bytes",
                buffer_size,
                l_subch,
                tb
            );

            let params = NrSlTransmissionParams {
                priority: reference.priority,
                pdb_ms: reference.pdb_ms,
                l_subch,
                rri_ms: allocation.rri_ms,
                c_resel: allocation.c_resel,
            };
            let offered = mac.candidate_resources(sfn, &params)?;
            let filtered = self.grants.filter_tx_opportunities(
                sfn,
                offered,
                allocation.rri_ms,
                allocation.c_resel,
                self.config.allow_multiple_destinations_per_slot,
                &*mac,
            );
            if filtered.is_empty() {
                debug!("Resources not found for {} subchannels", l_subch);
                break;
            }
            tb_size = tb;
            candidates = filtered;
        }
        if candidates.is_empty() {
            debug!("Unable to find resources for destination {}", dst_l2_id);
            return Ok(None);
        }
        allocation.tb_size = tb_size;

        // LCs of one priority are served equally, each subPDU costing a
        // MAC subheader on top of its share
        let mut allocated = 0u32;
        for tier in &queue {
            let budget = tb_size.saturating_sub(allocated + SCI_2A_BYTES);
            let per_lc_budget = (budget / tier.len() as u32).saturating_sub(SUBHEADER_BYTES);
            let share = tier
                .iter()
                .map(|lc| lc.total_queue_size())
                .min()
                .unwrap_or(0)
                .min(per_lc_budget);
            if share == 0 {
                break;
            }
            for lc in tier {
                info!("LC {} of destination {} allocated {} bytes", lc.id, dst_l2_id, share);
                allocation.allocated_rlc_pdus.push(SlRlcPduInfo::new(lc.id, share));
                allocated += share + SUBHEADER_BYTES;
            }
        }

        Ok(Some(LcpOutcome { dst_l2_id, allocation, candidates }))
    }

    fn attempt_grant_allocation(
        &mut self,
        sfn: &SfnSf,
        outcome: LcpOutcome,
        mac: &mut dyn SchedulerMac,
    ) -> Result<(), LayerError> {
        let LcpOutcome { dst_l2_id, allocation, candidates } = outcome;
        let selected = if allocation.harq_enabled && mac.psfch_period() == 0 {
            select_resources_for_blind_retransmissions(
                candidates,
                mac.max_tx_trans_num_pssch(),
                &mut self.grant_selection_rng,
            )
        } else {
            let total_tx = if allocation.harq_enabled { mac.max_tx_trans_num_pssch() } else { 1 };
            select_resources_with_constraint(candidates, total_tx, &*mac, &mut self.grant_selection_rng)
        };
        if selected.is_empty() {
            return Err(LayerError::InvalidState(format!(
                "No slot selected for destination {}",
                dst_l2_id
            )));
        }
        let dst: &SlDestinationInfo = self.dsts.get(dst_l2_id).ok_or(LayerError::UnknownDestination(dst_l2_id))?;
        let slots = build_slot_allocations(&selected, dst, &allocation);
        self.grants.create_grant(sfn, dst_l2_id, slots, &allocation, mac)?;
        Ok(())
    }
}

impl NrSlUeMacScheduler for NrSlUeMacSchedulerFixedMcs {
    fn csched_lc_config_req(&mut self, params: &SidelinkLogicalChannelInfo) -> Result<(), LayerError> {
        self.dsts.configure_lc(params)
    }

    fn remove_lc_config_req(&mut self, lcid: u8, dst_l2_id: u32) {
        self.dsts.remove_lc(lcid, dst_l2_id);
    }

    fn sched_rlc_buffer_req(&mut self, params: &NrSlReportBufferStatus) -> Result<(), LayerError> {
        self.dsts.update_buffer(params)
    }

    fn sched_trigger_req(&mut self, sfn: &SfnSf, mac: &mut dyn SchedulerMac) -> Result<(), LayerError> {
        if mac.harq().num_available_total() == 0 {
            debug!("No HARQ process available at {}, only publishing grants", sfn);
            return self.grants.publish(sfn, mac);
        }

        let mut to_sched = self.dsts_and_lcs_needing_scheduling(sfn, mac)?;
        while !to_sched.is_empty() {
            let Some(outcome) = self.logical_channel_prioritization(sfn, &to_sched, mac)? else {
                break;
            };
            if outcome.allocation.allocated_rlc_pdus.is_empty() {
                break;
            }
            let dst_l2_id = outcome.dst_l2_id;
            let served: Vec<u8> = outcome.allocation.allocated_rlc_pdus.iter().map(|p| p.lcid).collect();
            self.attempt_grant_allocation(sfn, outcome, mac)?;

            if let Some(lcids) = to_sched.get_mut(&dst_l2_id) {
                lcids.retain(|lcid| !served.contains(lcid));
                if lcids.is_empty() {
                    to_sched.remove(&dst_l2_id);
                }
            }
        }
        self.grants.publish(sfn, mac)
    }

    fn notify_pdu_dequeue(&mut self, dst_l2_id: u32, lcid: u8, size: u32) -> Result<(), LayerError> {
        self.dsts.assigned_data(dst_l2_id, lcid, size)
    }

    fn assign_streams(&mut self, seed: u64) -> u64 {
        self.grant_selection_rng = StdRng::seed_from_u64(seed);
        self.dst_rng = StdRng::seed_from_u64(seed.wrapping_add(1));
        self.ue_selected_rng = StdRng::seed_from_u64(seed.wrapping_add(2));
        3
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

    fn scheduler(priority_to_sps: bool) -> NrSlUeMacSchedulerFixedMcs {
        let config = SchedulerConfig { priority_to_sps, ..Default::default() };
        NrSlUeMacSchedulerFixedMcs::new(config, 1).unwrap()
    }

    fn now() -> SfnSf {
        SfnSf::from_normalized(100, 0).unwrap()
    }

    #[test]
    fn test_invalid_mcs() {
        let config = SchedulerConfig { mcs: 29, ..Default::default() };
        assert!(NrSlUeMacSchedulerFixedMcs::new(config, 1).is_err());
    }

    #[test]
    fn test_dynamic_grant_scheduled_and_published() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(10).unwrap();
        mac.offer_slots(&[102], 1);
        let mut sched = scheduler(true);
        sched.csched_lc_config_req(&lc_info(10, 4, 1, true, 0)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 4, 100)).unwrap();

        sched.sched_trigger_req(&now(), &mut mac).unwrap();
        assert_eq!(mac.requests.len(), 1);
        assert_eq!(mac.requests[0].l_subch, 1);
        assert_eq!(mac.published.len(), 1);
        let (dst, grant) = &mac.published[0];
        assert_eq!(*dst, 10);
        assert_eq!(grant.tb_size, 100);
        let first = grant.slot_allocations.first().unwrap();
        assert_eq!(first.sl_rlc_pdu_info, vec![SlRlcPduInfo::new(4, 100)]);
        assert_eq!(first.mcs, 14);
        assert_eq!(sched.grants().num_grants(), 0);
    }

    #[test]
    fn test_empty_pool_creates_no_grant() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(10).unwrap();
        let mut sched = scheduler(true);
        sched.csched_lc_config_req(&lc_info(10, 4, 1, true, 0)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 4, 100)).unwrap();
        sched.sched_trigger_req(&now(), &mut mac).unwrap();
        assert!(mac.published.is_empty());
        assert_eq!(sched.grants().num_grants(), 0);
        assert_eq!(mac.harq.num_available(10), 4);
    }

    #[test]
    fn test_no_harq_process_skips_selection() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.offer_slots(&[102], 1);
        let mut sched = scheduler(true);
        sched.csched_lc_config_req(&lc_info(10, 4, 1, true, 0)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 4, 100)).unwrap();
        sched.sched_trigger_req(&now(), &mut mac).unwrap();
        assert!(mac.requests.is_empty());
        assert!(mac.published.is_empty());
    }

    #[test]
    fn test_sps_wins_priority_tie() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(10).unwrap();
        mac.offer_slots(&[102], 1);
        let mut sched = scheduler(true);
        sched.csched_lc_config_req(&lc_info(10, 4, 5, true, 0)).unwrap();
        sched.csched_lc_config_req(&lc_info(10, 5, 5, false, 100)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 4, 100)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 5, 100)).unwrap();

        sched.sched_trigger_req(&now(), &mut mac).unwrap();
        assert_eq!(mac.published.len(), 1);
        let grant = &mac.published[0].1;
        assert_eq!(grant.rri_ms, 100);
        assert_eq!(grant.slot_allocations.first().unwrap().sl_rlc_pdu_info[0].lcid, 5);
        let held = &sched.grants().grants_of(10)[0];
        assert!(!held.is_dynamic);
        assert!((4..=14).contains(&held.sl_reso_resel_counter));
        assert_eq!(mac.requests[0].c_resel, held.c_resel_counter + 1);
    }

    #[test]
    fn test_dynamic_wins_priority_tie_without_sps_priority() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(10).unwrap();
        mac.offer_slots(&[102], 1);
        let mut sched = scheduler(false);
        sched.csched_lc_config_req(&lc_info(10, 4, 5, true, 0)).unwrap();
        sched.csched_lc_config_req(&lc_info(10, 5, 5, false, 100)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 4, 100)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 5, 100)).unwrap();

        sched.sched_trigger_req(&now(), &mut mac).unwrap();
        assert_eq!(mac.published.len(), 1);
        let grant = &mac.published[0].1;
        assert_eq!(grant.rri_ms, 0);
        assert_eq!(grant.slot_allocations.first().unwrap().sl_rlc_pdu_info[0].lcid, 4);
    }

    #[test]
    fn test_highest_priority_destination_served_first() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(10).unwrap();
        mac.harq.add_dst(20).unwrap();
        mac.offer_slots(&[102], 1);
        let mut sched = scheduler(true);
        sched.csched_lc_config_req(&lc_info(10, 4, 1, true, 0)).unwrap();
        sched.csched_lc_config_req(&lc_info(20, 4, 7, true, 0)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 4, 100)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(20, 4, 100)).unwrap();

        sched.sched_trigger_req(&now(), &mut mac).unwrap();
        assert_eq!(mac.published.len(), 1);
        assert_eq!(mac.published[0].0, 20);
    }

    #[test]
    fn test_equal_priority_lcs_share_tb() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(10).unwrap();
        mac.offer_slots(&[102], 2);
        let mut sched = scheduler(true);
        sched.csched_lc_config_req(&lc_info(10, 4, 3, true, 0)).unwrap();
        sched.csched_lc_config_req(&lc_info(10, 5, 3, true, 0)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 4, 100)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 5, 300)).unwrap();

        sched.sched_trigger_req(&now(), &mut mac).unwrap();
        assert_eq!(mac.requests[0].l_subch, 2);
        let grant = &mac.published[0].1;
        assert_eq!(
            grant.slot_allocations.first().unwrap().sl_rlc_pdu_info,
            vec![SlRlcPduInfo::new(4, 100), SlRlcPduInfo::new(5, 100)]
        );
        assert_eq!(grant.tb_size, 200);
    }

    #[test]
    fn test_allocation_bounded_by_tb() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(10).unwrap();
        mac.offer_slots(&[102], 5);
        let mut sched = scheduler(true);
        sched.csched_lc_config_req(&lc_info(10, 4, 3, true, 0)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 4, 5000)).unwrap();

        sched.sched_trigger_req(&now(), &mut mac).unwrap();
        assert_eq!(mac.requests[0].l_subch, 5);
        let tb = NrSlAmc::new().calculate_tb_size(14, 1, 5 * 10 * 9).unwrap();
        let grant = &mac.published[0].1;
        assert_eq!(grant.tb_size, tb - SCI_2A_BYTES - SUBHEADER_BYTES);
    }

    #[test]
    fn test_dequeue_accounting() {
        let mut sched = scheduler(true);
        sched.csched_lc_config_req(&lc_info(10, 4, 3, true, 0)).unwrap();
        sched.sched_rlc_buffer_req(&bsr(10, 4, 300)).unwrap();
        sched.notify_pdu_dequeue(10, 4, 120).unwrap();
        let dst = sched.dst_info(10).unwrap();
        assert_eq!(dst.lcg_of(4).unwrap().total_size_of_lc(4), Some(180));
        assert!(sched.notify_pdu_dequeue(11, 4, 1).is_err());
        assert_eq!(sched.assign_streams(5), 3);
    }
}
