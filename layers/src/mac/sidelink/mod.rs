//! NR Sidelink UE MAC
//!
//! Mode 2 (UE-selected) resource allocation: candidate resource generation
//! with optional sensing, logical channel prioritization, grant selection and
//! lifecycle, HARQ and the per-slot transmission step of the UE MAC.

pub mod amc;
pub mod candidate;
pub mod harq;
pub mod lcg;
pub mod phy_mac_common;
pub mod resource_pool;
pub mod scheduler;
pub mod sci;
pub mod ue_mac;

pub use candidate::{CandidateResourceGenerator, SensingConfig};
pub use harq::NrSlUeMacHarq;
pub use phy_mac_common::{
    NrSlGrant, NrSlReportBufferStatus, NrSlRlcPdu, NrSlTxOpportunity, SensingData, SidelinkLcIdentifier,
    SidelinkLogicalChannelInfo, SlHarqInfo, SlResourceInfo,
};
pub use resource_pool::{BitmapResourcePool, SlPoolConfig, SlResourcePool};
pub use scheduler::{create_scheduler, NrSlUeMacScheduler, SchedulerConfig, SchedulerKind};
pub use ue_mac::{
    NrSlMacSapUser, NrSlSlotTransmission, NrSlUeMac, NrSlUeMacConfig, NrSlUeMacStats, PsschReception,
    SlPsschTransmission,
};
