//! Sidelink Grant Lifecycle
//!
//! Resource selection among filtered candidates, grant creation (dynamic and
//! semi-persistent), resource re-selection checks and grant publication
//! towards the MAC (3GPP TS 38.321 Section 5.22.1.1).

use crate::LayerError;
use common::SfnSf;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::{debug, info, trace};

use super::{AllocationInfo, GrantInfo, SchedulerMac};
use crate::mac::sidelink::lcg::{SlDestinationInfo, SlLogicalChannel};
use crate::mac::sidelink::phy_mac_common::{GrantSlots, NrSlGrant, SlGrantResource, SlResourceInfo};
use crate::mac::sidelink::resource_pool::{PSSCH_SYMBOLS, PSSCH_SYMBOLS_WITH_PSFCH};

/// Upper bound of the search for the next PSFCH slot
const MAX_PSFCH_SEARCH_SLOTS: u64 = 10240;

/// Redundancy version of the `tx_num_tb`-th transmission of a TB
pub fn get_rv(tx_num_tb: u8) -> u8 {
    match tx_num_tb % 4 {
        0 => 0,
        1 => 2,
        2 => 3,
        _ => 1,
    }
}

/// Draw the resource re-selection counter for a reservation period
/// (TS 38.321 Section 5.22.1.1)
pub fn random_reselection_counter<R: Rng + ?Sized>(rri_ms: u16, rng: &mut R) -> Result<u8, LayerError> {
    let (min, max) = match rri_ms {
        100..=1000 if rri_ms % 50 == 0 && rri_ms != 650 => (5, 15),
        p if p < 100 => {
            let factor = (100 / p.max(20)) as u8;
            (5 * factor, 15 * factor)
        }
        p => {
            return Err(LayerError::InvalidConfiguration(format!(
                "Reservation period {} ms not supported",
                p
            )))
        }
    };
    Ok(rng.gen_range(min..=max))
}

/// Whether two resources share a slot and at least one subchannel
pub fn overlapped_resources(
    first_sfn: &SfnSf,
    first_start: u16,
    first_length: u16,
    second_sfn: &SfnSf,
    second_start: u16,
    second_length: u16,
) -> bool {
    first_sfn == second_sfn
        && first_start.max(second_start) < (first_start + first_length).min(second_start + second_length)
}

fn overlapped_slots(resources: &[SlResourceInfo], candidate: &SlResourceInfo) -> bool {
    resources.iter().any(|r| r.same_slot(candidate))
}

/// Random selection of up to `total_tx` resources in distinct slots, used for
/// blind retransmissions without PSFCH
pub fn select_resources_for_blind_retransmissions<R: Rng + ?Sized>(
    mut tx_opps: Vec<SlResourceInfo>,
    total_tx: u8,
    rng: &mut R,
) -> Vec<SlResourceInfo> {
    let total_tx = total_tx as usize;
    let mut selected: Vec<SlResourceInfo> = Vec::new();
    if tx_opps.len() > total_tx {
        while selected.len() != total_tx && !tx_opps.is_empty() {
            let candidate = tx_opps.remove(rng.gen_range(0..tx_opps.len()));
            if !overlapped_slots(&selected, &candidate) {
                selected.push(candidate);
            }
        }
    } else {
        for candidate in tx_opps {
            if !overlapped_slots(&selected, &candidate) {
                selected.push(candidate);
            }
        }
    }
    SlResourceInfo::sort_by_slot(&mut selected);
    selected
}

/// Random selection of up to `total_tx` resources honouring the minimum time
/// gap needed for HARQ feedback between consecutive transmissions
pub fn select_resources_with_constraint<R: Rng + ?Sized>(
    mut tx_opps: Vec<SlResourceInfo>,
    total_tx: u8,
    mac: &dyn SchedulerMac,
    rng: &mut R,
) -> Vec<SlResourceInfo> {
    let mut selected: Vec<SlResourceInfo> = Vec::new();
    while selected.len() < total_tx as usize && !tx_opps.is_empty() {
        let candidate = tx_opps.remove(rng.gen_range(0..tx_opps.len()));
        if is_candidate_resource_eligible(&selected, &candidate, mac) {
            selected.push(candidate);
            SlResourceInfo::sort_by_slot(&mut selected);
        }
    }
    selected
}

/// Whether `second` comes late enough after `first` for the PSFCH of `first`
/// to be received and processed
pub fn is_min_time_gap_satisfied(
    first: &SfnSf,
    second: &SfnSf,
    min_time_gap_psfch: u8,
    min_time_gap_processing: u8,
    mac: &dyn SchedulerMac,
) -> bool {
    let mut slot = first.future(min_time_gap_psfch as u64);
    if mac.psfch_period() > 0 {
        let mut searched = 0;
        while !mac.slot_has_psfch(&slot) {
            if searched == MAX_PSFCH_SEARCH_SLOTS {
                return false;
            }
            slot.add(1);
            searched += 1;
        }
    }
    slot.add(min_time_gap_processing as u64);
    slot.normalize() <= second.normalize()
}

/// Whether a candidate can join the slot-sorted selection
pub fn is_candidate_resource_eligible(
    selected: &[SlResourceInfo],
    candidate: &SlResourceInfo,
    mac: &dyn SchedulerMac,
) -> bool {
    let (Some(first), Some(last)) = (selected.first(), selected.last()) else {
        return true;
    };
    if overlapped_slots(selected, candidate) {
        return false;
    }
    let slot = candidate.sfn.normalize();
    let gap = |from: &SlResourceInfo, to: &SfnSf, reference: &SlResourceInfo| {
        is_min_time_gap_satisfied(
            &from.sfn,
            to,
            reference.sl_min_time_gap_psfch,
            reference.sl_min_time_gap_processing,
            mac,
        )
    };
    if slot < first.sfn.normalize() {
        gap(candidate, &first.sfn, first)
    } else if slot > last.sfn.normalize() {
        gap(last, &candidate.sfn, last)
    } else {
        let Some(right) = selected.iter().position(|r| r.sfn.normalize() > slot) else {
            return false;
        };
        let left = &selected[right - 1];
        let right = &selected[right];
        gap(left, &candidate.sfn, left) && gap(candidate, &right.sfn, right)
    }
}

/// Slot allocations of a new grant from the selected resources
pub fn build_slot_allocations(
    selected: &[SlResourceInfo],
    dst: &SlDestinationInfo,
    allocation: &AllocationInfo,
) -> GrantSlots {
    let n = selected.len();
    let mut slots = GrantSlots::new();
    for (index, resource) in selected.iter().enumerate() {
        let max_per_reserve = resource.sl_max_num_per_reserve.max(1) as usize;
        let (tx_sci1a, slot_num_ind) = if index % max_per_reserve == 0 {
            let reserved = if index + max_per_reserve <= n { max_per_reserve } else { n - index };
            (true, reserved as u8)
        } else {
            (false, 0)
        };
        slots.insert(SlGrantResource {
            sfn: resource.sfn,
            dst_l2_id: dst.dst_l2_id(),
            ndi: u8::from(index == 0),
            rv: get_rv(index as u8),
            priority: allocation.priority,
            sl_rlc_pdu_info: allocation.allocated_rlc_pdus.clone(),
            mcs: dst.mcs(),
            num_sl_pscch_rbs: resource.num_sl_pscch_rbs,
            sl_pscch_sym_start: resource.sl_pscch_sym_start,
            sl_pscch_sym_length: resource.sl_pscch_sym_length,
            sl_pssch_sym_start: resource.sl_pssch_sym_start,
            sl_pssch_sym_length: resource.sl_pssch_sym_length,
            sl_pssch_subch_start: resource.sl_subchannel_start as u16,
            sl_pssch_subch_length: resource.sl_subchannel_length as u16,
            max_num_per_reserve: resource.sl_max_num_per_reserve,
            sl_has_psfch: resource.sl_pssch_sym_length == PSSCH_SYMBOLS_WITH_PSFCH,
            tx_sci1a,
            slot_num_ind,
        });
    }
    slots
}

/// Grants of all destinations and the slots already published to the MAC
#[derive(Debug, Clone, Default)]
pub struct GrantLifecycleManager {
    grants: BTreeMap<u32, Vec<GrantInfo>>,
    published: Vec<SlGrantResource>,
}

impl GrantLifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants held for a destination
    pub fn grants_of(&self, dst_l2_id: u32) -> &[GrantInfo] {
        self.grants.get(&dst_l2_id).map_or(&[], |v| v.as_slice())
    }

    /// Grants held over all destinations
    pub fn num_grants(&self) -> usize {
        self.grants.values().map(Vec::len).sum()
    }

    /// Published slots not yet in the past
    pub fn published(&self) -> &[SlGrantResource] {
        &self.published
    }

    /// Decide whether an LC needs a new grant at `sfn`.
    ///
    /// An SPS grant whose re-selection counter expired is either kept with
    /// probability `prob_resource_keep` or released together with its HARQ
    /// process.
    pub fn reselection_check<R: Rng + ?Sized>(
        &mut self,
        sfn: &SfnSf,
        dst_l2_id: u32,
        lc: &SlLogicalChannel,
        mac: &mut dyn SchedulerMac,
        rng: &mut R,
    ) -> Result<bool, LayerError> {
        if lc.total_queue_size() == 0 {
            return Ok(false);
        }
        let grants = self.grants.entry(dst_l2_id).or_default();
        let found = grants.iter().position(|g| g.covers_lc(lc.id));

        if lc.dynamic {
            return Ok(found.is_none());
        }
        let Some(index) = found else {
            return Ok(true);
        };
        let grant = &mut grants[index];
        if grant.sl_reso_resel_counter != 0 {
            trace!("LC {} of {} already has an active SPS grant", lc.id, dst_l2_id);
            return Ok(false);
        }
        if grant.reserved_slots.last().is_some_and(|slot| slot.sfn.normalize() >= sfn.normalize()) {
            trace!("Last reserved TB of LC {} for {} still pending", lc.id, dst_l2_id);
            return Ok(false);
        }
        if grant.c_resel_counter > 0 {
            let draw: f64 = rng.gen();
            if mac.prob_resource_keep() > draw {
                debug!(
                    "Keeping SPS resources of LC {} for {}: probability {} above draw {}",
                    lc.id,
                    dst_l2_id,
                    mac.prob_resource_keep(),
                    draw
                );
                grant.sl_reso_resel_counter = grant.prev_sl_reso_resel_counter;
                if grant.slot_allocations.is_empty() {
                    renew_reservation(grant, sfn, &*mac)?;
                }
                let deadline = sps_grant_deadline(sfn, grant.prev_sl_reso_resel_counter, grant.rri_ms, &*mac);
                let harq_id = grant.harq_id;
                if !mac.harq().renew_timer(dst_l2_id, harq_id, deadline) {
                    return Err(LayerError::InvalidState(format!(
                        "Timer of HARQ ID {} failed to renew",
                        harq_id
                    )));
                }
                return Ok(false);
            }
        }
        let released = grants.remove(index);
        mac.harq().deallocate(dst_l2_id, released.harq_id);
        debug!("Released SPS grant of LC {} for {}, HARQ ID {}", lc.id, dst_l2_id, released.harq_id);
        Ok(true)
    }

    /// Materialize a grant from selected slot allocations.
    ///
    /// Returns false when no HARQ process is available.
    pub fn create_grant(
        &mut self,
        sfn: &SfnSf,
        dst_l2_id: u32,
        slots: GrantSlots,
        allocation: &AllocationInfo,
        mac: &mut dyn SchedulerMac,
    ) -> Result<bool, LayerError> {
        let pdus = match slots.first() {
            Some(first) => first.sl_rlc_pdu_info.clone(),
            None => return Err(LayerError::InvalidState(format!("Grant to {} has no allocated slots", dst_l2_id))),
        };
        let grants = self.grants.entry(dst_l2_id).or_default();
        if grants
            .iter()
            .any(|g| g.covers_same_lcs(&pdus) && (allocation.is_dynamic || g.rri_ms == allocation.rri_ms))
        {
            return Err(LayerError::InvalidState(format!(
                "Attempt to update an existing grant of destination {}",
                dst_l2_id
            )));
        }

        let (mut grant, deadline) = if allocation.is_dynamic {
            let deadline = dynamic_grant_deadline(sfn, &slots, allocation.harq_enabled, &*mac)?;
            (single_pdu_grant_info(slots, allocation), deadline)
        } else {
            let grant = sps_grant_info(sfn, slots, allocation, &*mac)?;
            let deadline = sps_grant_deadline(sfn, grant.sl_reso_resel_counter, allocation.rri_ms, &*mac);
            (grant, deadline)
        };
        let Some(harq_id) = mac.harq().allocate(dst_l2_id, !allocation.is_dynamic, deadline) else {
            debug!("No HARQ process available for destination {}, grant dropped", dst_l2_id);
            return Ok(false);
        };
        grant.harq_id = harq_id;
        grant.harq_enabled = allocation.harq_enabled && mac.psfch_period() > 0;
        grant.cast_type = allocation.cast_type;
        info!(
            "Grant created for {}: dynamic {}, HARQ ID {}, {} slots, resel counter {}, RRI {} ms",
            dst_l2_id,
            grant.is_dynamic,
            grant.harq_id,
            grant.slot_allocations.len(),
            grant.sl_reso_resel_counter,
            grant.rri_ms
        );
        grants.push(grant);
        Ok(true)
    }

    /// Publish to the MAC every grant whose next new transmission falls
    /// within T1 of `sfn`, together with its retransmissions
    pub fn publish(&mut self, sfn: &SfnSf, mac: &mut dyn SchedulerMac) -> Result<(), LayerError> {
        let now = sfn.normalize();
        let horizon = now + mac.t1() as u64;
        let Self { grants, published } = self;

        for (dst_l2_id, dst_grants) in grants.iter_mut() {
            let mut index = 0;
            while index < dst_grants.len() {
                let grant = &mut dst_grants[index];
                if !grant.is_dynamic && grant.sl_reso_resel_counter == 0 {
                    index += 1;
                    continue;
                }
                let Some(first) = grant.slot_allocations.first() else {
                    let released = dst_grants.remove(index);
                    if !released.is_dynamic {
                        mac.harq().deallocate(*dst_l2_id, released.harq_id);
                    }
                    continue;
                };
                if first.sfn.normalize() > horizon {
                    index += 1;
                    continue;
                }
                if first.ndi != 1 {
                    return Err(LayerError::InvalidState("New data indication not found".to_string()));
                }
                if first.sfn.normalize() < now {
                    return Err(LayerError::InvalidState(format!(
                        "Stale slot {} in grants of destination {}",
                        first.sfn, dst_l2_id
                    )));
                }

                let mut current = GrantSlots::new();
                let mut tb_size = 0;
                while let Some(slot) = grant.slot_allocations.first() {
                    if !current.is_empty() && slot.ndi != 0 {
                        break;
                    }
                    let Some(slot) = grant.slot_allocations.pop_first() else {
                        break;
                    };
                    if current.is_empty() {
                        tb_size = slot.sl_rlc_pdu_info.iter().map(|p| p.size).sum();
                    }
                    published.push(slot.clone());
                    current.insert(slot);
                }
                grant.tb_tx_counter = 1;
                let nr_sl_grant = NrSlGrant {
                    slot_allocations: current,
                    harq_enabled: grant.harq_enabled,
                    harq_id: grant.harq_id,
                    n_selected: grant.n_selected,
                    tb_tx_counter: grant.tb_tx_counter,
                    tb_size,
                    rri_ms: grant.rri_ms,
                    cast_type: grant.cast_type,
                };
                debug!(
                    "Publishing grant to {} at {}: HARQ ID {}, {} slots, TB {} bytes",
                    dst_l2_id,
                    sfn,
                    nr_sl_grant.harq_id,
                    nr_sl_grant.slot_allocations.len(),
                    tb_size
                );
                let nr_sl_grant_slots = nr_sl_grant.slot_allocations.clone();
                mac.sched_config_ind(*dst_l2_id, nr_sl_grant);

                if grant.is_dynamic {
                    dst_grants.remove(index);
                } else {
                    // The grant outlives its last period so that the
                    // re-selection check keeps or releases its HARQ process
                    grant.reserved_slots = nr_sl_grant_slots;
                    grant.sl_reso_resel_counter = grant.sl_reso_resel_counter.saturating_sub(1);
                    grant.c_resel_counter = grant.c_resel_counter.saturating_sub(1);
                    index += 1;
                }
            }
        }
        grants.retain(|_, v| !v.is_empty());
        Ok(())
    }

    /// Remove candidates colliding with published slots or with slots of
    /// existing grants, projected over `c_resel` reservation periods
    pub fn filter_tx_opportunities(
        &mut self,
        sfn: &SfnSf,
        mut tx_opps: Vec<SlResourceInfo>,
        rri_ms: u16,
        c_resel: u16,
        allow_multiple_destinations_per_slot: bool,
        mac: &dyn SchedulerMac,
    ) -> Vec<SlResourceInfo> {
        if tx_opps.is_empty() {
            return tx_opps;
        }
        let conflicts = |sfn_a: &SfnSf, start: u16, length: u16, candidate: &SfnSf, opp: &SlResourceInfo| {
            if allow_multiple_destinations_per_slot {
                overlapped_resources(
                    sfn_a,
                    start,
                    length,
                    candidate,
                    opp.sl_subchannel_start as u16,
                    opp.sl_subchannel_length as u16,
                )
            } else {
                sfn_a == candidate
            }
        };

        for p in &self.published {
            tx_opps.retain(|opp| !conflicts(&p.sfn, p.sl_pssch_subch_start, p.sl_pssch_subch_length, &opp.sfn, opp));
        }
        let now = sfn.normalize();
        self.published.retain(|p| p.sfn.normalize() >= now);

        let period = mac.reservation_period_in_slots(rri_ms, sfn.numerology()) as u64;
        let projections = if period == 0 { 0 } else { c_resel as u64 };
        for grant in self.grants.values().flatten() {
            for alloc in grant.slot_allocations.iter() {
                tx_opps.retain(|opp| {
                    for i in 0..=projections {
                        let candidate = opp.sfn.future(i * period);
                        if alloc.sfn.normalize() < candidate.normalize() {
                            break;
                        }
                        if conflicts(&alloc.sfn, alloc.sl_pssch_subch_start, alloc.sl_pssch_subch_length, &candidate, opp) {
                            return false;
                        }
                    }
                    true
                });
            }
        }
        tx_opps
    }
}

/// Absolute slot at which the HARQ process of an SPS grant times out
pub fn sps_grant_deadline(sfn: &SfnSf, resel_counter: u8, rri_ms: u16, mac: &dyn SchedulerMac) -> u64 {
    let period = mac.reservation_period_in_slots(rri_ms, sfn.numerology()) as u64;
    sfn.normalize() + period * (resel_counter as u64 + 1)
}

/// Absolute slot at which the HARQ process of a dynamic grant times out.
///
/// With HARQ feedback the process lives until the PSFCH slot following the
/// last transmission.
pub fn dynamic_grant_deadline(
    sfn: &SfnSf,
    slots: &GrantSlots,
    harq_enabled: bool,
    mac: &dyn SchedulerMac,
) -> Result<u64, LayerError> {
    let last = slots
        .last()
        .ok_or_else(|| LayerError::InvalidState("Grant has no allocated slots".to_string()))?;
    if last.sfn.normalize() < sfn.normalize() {
        return Err(LayerError::InvalidState(format!("Allocation at {} occurs in the past", last.sfn)));
    }
    if !(harq_enabled && mac.psfch_period() > 0) {
        return Ok(last.sfn.normalize() + 1);
    }
    let mut slot = last.sfn.future(1);
    for _ in 0..MAX_PSFCH_SEARCH_SLOTS {
        if mac.slot_has_psfch(&slot) {
            return Ok(slot.normalize() + 1);
        }
        slot.add(1);
    }
    Err(LayerError::InvalidState("No PSFCH slot after the last transmission".to_string()))
}

fn single_pdu_grant_info(slots: GrantSlots, allocation: &AllocationInfo) -> GrantInfo {
    GrantInfo {
        n_selected: slots.len() as u8,
        is_dynamic: true,
        cast_type: allocation.cast_type,
        slot_allocations: slots,
        ..Default::default()
    }
}

/// SPS grant: the selected slots repeated `resel_counter` times, one
/// reservation period apart, with PSFCH occupancy of each future slot
fn sps_grant_info(
    sfn: &SfnSf,
    slots: GrantSlots,
    allocation: &AllocationInfo,
    mac: &dyn SchedulerMac,
) -> Result<GrantInfo, LayerError> {
    if allocation.resel_counter == 0 {
        return Err(LayerError::InvalidState(
            "Can not create SPS grants with 0 resource selection counter".to_string(),
        ));
    }
    if allocation.c_resel == 0 {
        return Err(LayerError::InvalidState("Can not create SPS grants with 0 cResel counter".to_string()));
    }
    if allocation.rri_ms == 0 {
        return Err(LayerError::InvalidState("Can not create SPS grants with 0 RRI".to_string()));
    }
    let period = mac.reservation_period_in_slots(allocation.rri_ms, sfn.numerology()) as u64;
    let mut grant = GrantInfo {
        c_resel_counter: allocation.c_resel,
        sl_reso_resel_counter: allocation.resel_counter,
        prev_sl_reso_resel_counter: allocation.resel_counter,
        n_selected: slots.len() as u8,
        rri_ms: allocation.rri_ms,
        cast_type: allocation.cast_type,
        ..Default::default()
    };
    reserve_periods(&mut grant.slot_allocations, &slots, 0, allocation.resel_counter, period, mac)?;
    Ok(grant)
}

/// Insert `count` copies of `slots`, shifted by whole reservation periods
/// starting `first_period` periods ahead
fn reserve_periods(
    target: &mut GrantSlots,
    slots: &GrantSlots,
    first_period: u64,
    count: u8,
    period: u64,
    mac: &dyn SchedulerMac,
) -> Result<(), LayerError> {
    for i in first_period..first_period + count as u64 {
        for slot in slots.iter() {
            let mut replica = slot.clone();
            replica.sfn = slot.sfn.future(i * period);
            replica.sl_has_psfch = mac.slot_has_psfch(&replica.sfn);
            replica.sl_pssch_sym_length = if replica.sl_has_psfch { PSSCH_SYMBOLS_WITH_PSFCH } else { PSSCH_SYMBOLS };
            if !target.insert(replica) {
                return Err(LayerError::InvalidState(format!(
                    "Slot allocation at {} already exists",
                    slot.sfn.future(i * period)
                )));
            }
        }
    }
    Ok(())
}

/// Re-arm a kept SPS grant whose reservation ran out: the last published
/// period is repeated from the first period starting after `sfn`
fn renew_reservation(grant: &mut GrantInfo, sfn: &SfnSf, mac: &dyn SchedulerMac) -> Result<(), LayerError> {
    let period = mac.reservation_period_in_slots(grant.rri_ms, sfn.numerology()) as u64;
    let Some(base) = grant.reserved_slots.first().map(|slot| slot.sfn.normalize()) else {
        return Err(LayerError::InvalidState(format!(
            "SPS grant with HARQ ID {} has no reservation to keep",
            grant.harq_id
        )));
    };
    if period == 0 {
        return Err(LayerError::InvalidState(format!("RRI {} ms maps to no slots", grant.rri_ms)));
    }
    let skip = sfn.normalize().saturating_sub(base) / period + 1;
    let reserved = std::mem::take(&mut grant.reserved_slots);
    reserve_periods(&mut grant.slot_allocations, &reserved, skip, grant.sl_reso_resel_counter, period, mac)?;
    debug!(
        "Kept SPS reservation of HARQ ID {}: {} slots from {}",
        grant.harq_id,
        grant.slot_allocations.len(),
        base + skip * period
    );
    grant.reserved_slots = reserved;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::mac::sidelink::phy_mac_common::SlRlcPduInfo;
    use crate::mac::sidelink::resource_pool::SlPoolConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn allocation(dynamic: bool, rri_ms: u16, resel: u8) -> AllocationInfo {
        AllocationInfo {
            priority: 3,
            is_dynamic: dynamic,
            tb_size: 100,
            allocated_rlc_pdus: vec![SlRlcPduInfo::new(4, 90)],
            rri_ms,
            resel_counter: resel,
            c_resel: resel as u16 * 10,
            ..Default::default()
        }
    }

    fn resources(mac: &MockMac, slots: &[u64]) -> Vec<SlResourceInfo> {
        mac.candidates
            .iter()
            .filter(|c| c.sl_subchannel_start == 0 && slots.contains(&c.sfn.normalize()))
            .cloned()
            .collect()
    }

    #[test]
    fn test_get_rv_sequence() {
        let rvs: Vec<u8> = (0..=4).map(get_rv).collect();
        assert_eq!(rvs, vec![0, 2, 3, 1, 0]);
    }

    #[test]
    fn test_reselection_counter_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert!((5..=15).contains(&random_reselection_counter(100, &mut rng).unwrap()));
            assert!((10..=30).contains(&random_reselection_counter(50, &mut rng).unwrap()));
            assert!((25..=75).contains(&random_reselection_counter(10, &mut rng).unwrap()));
        }
        assert!(random_reselection_counter(650, &mut rng).is_err());
        assert!(random_reselection_counter(1100, &mut rng).is_err());
        assert!(random_reselection_counter(125, &mut rng).is_err());
    }

    #[test]
    fn test_slot_allocation_fields() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.offer_slots(&[10, 12, 14, 16, 18], 1);
        let selected = resources(&mac, &[10, 12, 14, 16, 18]);
        let dst = SlDestinationInfo::new(7, 14);
        let slots = build_slot_allocations(&selected, &dst, &allocation(true, 0, 0));
        let fields: Vec<(u8, u8, bool, u8)> =
            slots.iter().map(|s| (s.ndi, s.rv, s.tx_sci1a, s.slot_num_ind)).collect();
        assert_eq!(
            fields,
            vec![(1, 0, true, 3), (0, 2, false, 0), (0, 3, false, 0), (0, 1, true, 2), (0, 0, false, 0)]
        );
        assert!(slots.iter().all(|s| s.dst_l2_id == 7 && s.mcs == 14));
    }

    #[test]
    fn test_dynamic_grant_published_with_retransmissions() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(7).unwrap();
        mac.offer_slots(&[102, 104, 106], 1);
        let selected = resources(&mac, &[102, 104, 106]);
        let dst = SlDestinationInfo::new(7, 14);
        let slots = build_slot_allocations(&selected, &dst, &allocation(true, 0, 0));
        let now = SfnSf::from_normalized(100, 0).unwrap();

        let mut manager = GrantLifecycleManager::new();
        assert!(manager.create_grant(&now, 7, slots, &allocation(true, 0, 0), &mut mac).unwrap());
        assert_eq!(mac.harq.num_available(7), 3);

        manager.publish(&now, &mut mac).unwrap();
        assert_eq!(mac.published.len(), 1);
        let (dst_id, grant) = &mac.published[0];
        assert_eq!(*dst_id, 7);
        assert_eq!(grant.slot_allocations.len(), 3);
        assert_eq!(grant.tb_size, 90);
        assert_eq!(grant.tb_tx_counter, 1);
        assert_eq!(manager.num_grants(), 0);
        assert_eq!(manager.published().len(), 3);
    }

    #[test]
    fn test_grant_not_published_before_t1() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(7).unwrap();
        mac.offer_slots(&[110], 1);
        let selected = resources(&mac, &[110]);
        let dst = SlDestinationInfo::new(7, 14);
        let slots = build_slot_allocations(&selected, &dst, &allocation(true, 0, 0));
        let mut manager = GrantLifecycleManager::new();
        let now = SfnSf::from_normalized(100, 0).unwrap();
        manager.create_grant(&now, 7, slots, &allocation(true, 0, 0), &mut mac).unwrap();
        manager.publish(&now, &mut mac).unwrap();
        assert!(mac.published.is_empty());
        manager.publish(&SfnSf::from_normalized(108, 0).unwrap(), &mut mac).unwrap();
        assert_eq!(mac.published.len(), 1);
    }

    #[test]
    fn test_sps_counters_decrease_until_reselection() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(7).unwrap();
        mac.offer_slots(&[102], 1);
        let selected = resources(&mac, &[102]);
        let dst = SlDestinationInfo::new(7, 14);
        let alloc = allocation(false, 100, 3);
        let slots = build_slot_allocations(&selected, &dst, &alloc);
        let start = SfnSf::from_normalized(100, 0).unwrap();

        let mut manager = GrantLifecycleManager::new();
        manager.create_grant(&start, 7, slots, &alloc, &mut mac).unwrap();
        let grant = &manager.grants_of(7)[0];
        assert_eq!(grant.slot_allocations.len(), 3);
        assert_eq!(grant.c_resel_counter, 30);
        let replicas: Vec<u64> = grant.slot_allocations.iter().map(|s| s.sfn.normalize()).collect();
        assert_eq!(replicas, vec![102, 202, 302]);

        let mut previous = (3, 30);
        for now in 100..=300u64 {
            manager.publish(&SfnSf::from_normalized(now, 0).unwrap(), &mut mac).unwrap();
            if let Some(grant) = manager.grants_of(7).first() {
                let counters = (grant.sl_reso_resel_counter, grant.c_resel_counter);
                assert!(counters.0 <= previous.0 && counters.1 <= previous.1);
                previous = counters;
            }
        }
        assert_eq!(mac.published.len(), 3);
        let grant = &manager.grants_of(7)[0];
        assert_eq!((grant.sl_reso_resel_counter, grant.c_resel_counter), (0, 27));
        assert!(grant.slot_allocations.is_empty());
        assert_eq!(grant.reserved_slots.first().unwrap().sfn.normalize(), 302);
        assert!(!mac.harq.is_available(7, grant.harq_id));
    }

    #[test]
    fn test_exhausted_sps_grant_kept_or_released() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(7).unwrap();
        mac.offer_slots(&[102], 1);
        let mut rng = StdRng::seed_from_u64(3);
        let alloc = allocation(false, 100, 2);
        let slots = build_slot_allocations(&resources(&mac, &[102]), &SlDestinationInfo::new(7, 14), &alloc);
        let mut manager = GrantLifecycleManager::new();
        manager.create_grant(&SfnSf::from_normalized(100, 0).unwrap(), 7, slots, &alloc, &mut mac).unwrap();
        for now in 100..=202u64 {
            manager.publish(&SfnSf::from_normalized(now, 0).unwrap(), &mut mac).unwrap();
        }
        assert_eq!(mac.published.len(), 2);

        let mut sps_lc = SlLogicalChannel::new(&lc_info(7, 4, 1, false, 100));
        sps_lc.tx_queue_size = 100;
        // last reserved TB at 202 not yet sent
        let pending = SfnSf::from_normalized(202, 0).unwrap();
        assert!(!manager.reselection_check(&pending, 7, &sps_lc, &mut mac, &mut rng).unwrap());

        // kept: the reservation restarts one period after the last one ahead of now
        mac.prob_keep = 1.0;
        let later = SfnSf::from_normalized(350, 0).unwrap();
        assert!(!manager.reselection_check(&later, 7, &sps_lc, &mut mac, &mut rng).unwrap());
        let grant = &manager.grants_of(7)[0];
        assert_eq!(grant.sl_reso_resel_counter, 2);
        let replicas: Vec<u64> = grant.slot_allocations.iter().map(|s| s.sfn.normalize()).collect();
        assert_eq!(replicas, vec![402, 502]);
        for now in 350..=502u64 {
            manager.publish(&SfnSf::from_normalized(now, 0).unwrap(), &mut mac).unwrap();
        }
        assert_eq!(mac.published.len(), 4);

        // released: the HARQ process returns to the pool
        mac.prob_keep = 0.0;
        let now = SfnSf::from_normalized(510, 0).unwrap();
        assert!(manager.reselection_check(&now, 7, &sps_lc, &mut mac, &mut rng).unwrap());
        assert_eq!(manager.num_grants(), 0);
        assert_eq!(mac.harq.num_available(7), 4);
    }

    #[test]
    fn test_sps_grant_requires_counters() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(7).unwrap();
        mac.offer_slots(&[102], 1);
        let selected = resources(&mac, &[102]);
        let dst = SlDestinationInfo::new(7, 14);
        let alloc = allocation(false, 100, 0);
        let slots = build_slot_allocations(&selected, &dst, &alloc);
        let now = SfnSf::from_normalized(100, 0).unwrap();
        let mut manager = GrantLifecycleManager::new();
        assert!(manager.create_grant(&now, 7, slots, &alloc, &mut mac).is_err());
    }

    #[test]
    fn test_no_harq_process_drops_grant() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.offer_slots(&[102], 1);
        let selected = resources(&mac, &[102]);
        let dst = SlDestinationInfo::new(7, 14);
        let slots = build_slot_allocations(&selected, &dst, &allocation(true, 0, 0));
        let now = SfnSf::from_normalized(100, 0).unwrap();
        let mut manager = GrantLifecycleManager::new();
        assert!(!manager.create_grant(&now, 7, slots, &allocation(true, 0, 0), &mut mac).unwrap());
        assert_eq!(manager.num_grants(), 0);
    }

    #[test]
    fn test_reselection_check() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(7).unwrap();
        mac.offer_slots(&[102], 1);
        let mut rng = StdRng::seed_from_u64(1);
        let now = SfnSf::from_normalized(100, 0).unwrap();
        let mut manager = GrantLifecycleManager::new();

        let mut dynamic_lc = SlLogicalChannel::new(&lc_info(7, 4, 1, true, 0));
        assert!(!manager.reselection_check(&now, 7, &dynamic_lc, &mut mac, &mut rng).unwrap());
        dynamic_lc.tx_queue_size = 100;
        assert!(manager.reselection_check(&now, 7, &dynamic_lc, &mut mac, &mut rng).unwrap());

        let mut sps_lc = SlLogicalChannel::new(&lc_info(7, 4, 1, false, 100));
        sps_lc.tx_queue_size = 100;
        let alloc = allocation(false, 100, 2);
        let selected = resources(&mac, &[102]);
        let slots = build_slot_allocations(&selected, &SlDestinationInfo::new(7, 14), &alloc);
        manager.create_grant(&now, 7, slots, &alloc, &mut mac).unwrap();
        assert!(!manager.reselection_check(&now, 7, &sps_lc, &mut mac, &mut rng).unwrap());

        // counter expired, resource kept
        manager.grants.get_mut(&7).unwrap()[0].sl_reso_resel_counter = 0;
        mac.prob_keep = 1.0;
        assert!(!manager.reselection_check(&now, 7, &sps_lc, &mut mac, &mut rng).unwrap());
        assert_eq!(manager.grants_of(7)[0].sl_reso_resel_counter, 2);

        // counter expired, resource released
        manager.grants.get_mut(&7).unwrap()[0].sl_reso_resel_counter = 0;
        mac.prob_keep = 0.0;
        assert!(manager.reselection_check(&now, 7, &sps_lc, &mut mac, &mut rng).unwrap());
        assert!(manager.grants_of(7).is_empty());
        assert_eq!(mac.harq.num_available(7), 4);
    }

    #[test]
    fn test_filter_removes_published_and_granted_slots() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.harq.add_dst(7).unwrap();
        mac.offer_slots(&[102, 103, 104, 105], 1);
        let now = SfnSf::from_normalized(100, 0).unwrap();
        let mut manager = GrantLifecycleManager::new();
        let dst = SlDestinationInfo::new(7, 14);
        let alloc = allocation(true, 0, 0);
        let slots = build_slot_allocations(&resources(&mac, &[102, 104]), &dst, &alloc);
        manager.create_grant(&now, 7, slots, &alloc, &mut mac).unwrap();

        let filtered = manager.filter_tx_opportunities(&now, mac.candidates.clone(), 0, 0, false, &mac);
        assert!(filtered.iter().all(|r| ![102, 104].contains(&r.sfn.normalize())));
        assert_eq!(filtered.len(), mac.candidates.len() / 2);

        let filtered = manager.filter_tx_opportunities(&now, mac.candidates.clone(), 0, 0, true, &mac);
        assert!(filtered
            .iter()
            .all(|r| !([102, 104].contains(&r.sfn.normalize()) && r.sl_subchannel_start == 0)));
        assert!(filtered.iter().any(|r| r.sfn.normalize() == 102));
    }

    #[test]
    fn test_min_time_gap_with_psfch() {
        let config = SlPoolConfig { psfch_period: 2, ..Default::default() };
        let mac = MockMac::new(config);
        let a = SfnSf::from_normalized(100, 0).unwrap();
        // PSFCH on even slots: 100 + 3 = 103 -> 104, + 2 = 106
        assert!(!is_min_time_gap_satisfied(&a, &SfnSf::from_normalized(105, 0).unwrap(), 3, 2, &mac));
        assert!(is_min_time_gap_satisfied(&a, &SfnSf::from_normalized(106, 0).unwrap(), 3, 2, &mac));
    }

    #[test]
    fn test_constrained_selection_keeps_gaps() {
        let config = SlPoolConfig { psfch_period: 1, ..Default::default() };
        let mut mac = MockMac::new(config);
        let slots: Vec<u64> = (100..140).collect();
        mac.offer_slots(&slots, 1);
        let mut rng = StdRng::seed_from_u64(3);
        let selected = select_resources_with_constraint(mac.candidates.clone(), 4, &mac, &mut rng);
        assert!(!selected.is_empty() && selected.len() <= 4);
        for pair in selected.windows(2) {
            assert!(pair[1].sfn.normalize() >= pair[0].sfn.normalize() + 5);
        }
    }

    #[test]
    fn test_blind_selection_distinct_slots() {
        let mut mac = MockMac::new(SlPoolConfig::default());
        mac.offer_slots(&[100, 101, 102], 1);
        let mut rng = StdRng::seed_from_u64(3);
        let selected = select_resources_for_blind_retransmissions(mac.candidates.clone(), 5, &mut rng);
        let slots: Vec<u64> = selected.iter().map(|r| r.sfn.normalize()).collect();
        assert_eq!(slots, vec![100, 101, 102]);
        let selected = select_resources_for_blind_retransmissions(mac.candidates.clone(), 2, &mut rng);
        assert_eq!(selected.len(), 2);
        assert_ne!(selected[0].sfn, selected[1].sfn);
    }

    #[test]
    fn test_overlapped_resources() {
        let a = SfnSf::from_normalized(10, 0).unwrap();
        let b = SfnSf::from_normalized(11, 0).unwrap();
        assert!(overlapped_resources(&a, 0, 2, &a, 1, 2));
        assert!(!overlapped_resources(&a, 0, 2, &a, 2, 2));
        assert!(!overlapped_resources(&a, 0, 2, &b, 0, 2));
    }
}
