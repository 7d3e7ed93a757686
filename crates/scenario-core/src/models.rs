//! Shared typed models used across the store, resolution, and scenario layers.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity constants
// ---------------------------------------------------------------------------

/// Highest source identity that may be allocated. Cached downstream
/// artifacts address sources by a 16-bit key, so ids never exceed this.
pub const MAX_SOURCE_ID: u16 = u16::MAX;

/// Valid TV channel range.
pub const TV_CHANNEL_MIN: i32 = 2;
pub const TV_CHANNEL_MAX: i32 = 69;

/// Valid FM channel range (88.1 MHz .. 107.9 MHz).
pub const FM_CHANNEL_MIN: i32 = 200;
pub const FM_CHANNEL_MAX: i32 = 300;

// ---------------------------------------------------------------------------
// 1. SourceId
// ---------------------------------------------------------------------------

/// Compact study-local identity of a source. Zero is reserved and never
/// represents a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct SourceId(u16);

impl SourceId {
    pub fn new(raw: u16) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for SourceId {
    type Error = String;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        SourceId::new(raw).ok_or_else(|| "source id 0 is reserved".to_string())
    }
}

impl From<SourceId> for u16 {
    fn from(id: SourceId) -> u16 {
        id.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// 2. Enumerations
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Tv,
    Fm,
    Wireless,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Tv => "tv",
            RecordType::Fm => "fm",
            RecordType::Wireless => "wireless",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tv" => Some(RecordType::Tv),
            "fm" => Some(RecordType::Fm),
            "wireless" => Some(RecordType::Wireless),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Country {
    Us,
    Ca,
    Mx,
}

/// Licensing status of an external record. Declaration order is preference
/// order: operating stations outrank proposals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    License,
    ConstructionPermit,
    Application,
    Other,
}

/// Propagation band used to select a curve offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    VhfLow,
    VhfHigh,
    Uhf,
    Fm,
}

/// Study type of the containing study; decides which record types a
/// scenario may admit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyType {
    Tv,
    Fm,
    Tv6Fm,
    TvOet74,
}

/// How candidates were selected by the external search.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Desireds,
    Undesireds,
    Protecteds,
}

impl StudyType {
    /// Whether a scenario in a study of this type accepts `record_type`
    /// records found by `search`.
    pub fn admits(self, record_type: RecordType, search: SearchType) -> bool {
        match (self, record_type) {
            (_, RecordType::Wireless) => {
                self == StudyType::TvOet74 && search == SearchType::Undesireds
            }
            (StudyType::Tv | StudyType::TvOet74, RecordType::Tv) => true,
            (StudyType::Fm, RecordType::Fm) => true,
            (StudyType::Tv6Fm, RecordType::Tv | RecordType::Fm) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// 3. Engineering payloads
// ---------------------------------------------------------------------------

/// Geographic position in decimal degrees, north and east positive.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Broadcast service as resolved by the external search collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub code: String,
    pub service_type: i32,
    /// Higher ranks are preferred when records are mutually exclusive.
    pub preference_rank: i32,
}

/// Record-type-specific attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FacilityKind {
    Tv {
        channel: i32,
        /// Transmitter sites of a distributed transmission system. Empty for
        /// single-site stations.
        #[serde(default)]
        dts_sites: Vec<GeoPoint>,
    },
    Fm {
        channel: i32,
        station_class: String,
    },
    Wireless {
        sector_id: String,
    },
}

/// Engineering attributes shared by external records and sources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub call_sign: String,
    /// External facility number, `0` when unknown.
    #[serde(default)]
    pub facility_id: i64,
    pub service: Service,
    pub country: Country,
    pub status: StatusType,
    pub location: GeoPoint,
    pub erp_kw: f64,
    #[serde(default)]
    pub haat_m: f64,
    pub kind: FacilityKind,
}

impl Facility {
    pub fn record_type(&self) -> RecordType {
        match self.kind {
            FacilityKind::Tv { .. } => RecordType::Tv,
            FacilityKind::Fm { .. } => RecordType::Fm,
            FacilityKind::Wireless { .. } => RecordType::Wireless,
        }
    }

    /// Channel number, absent for wireless facilities.
    pub fn channel(&self) -> Option<i32> {
        match self.kind {
            FacilityKind::Tv { channel, .. } | FacilityKind::Fm { channel, .. } => Some(channel),
            FacilityKind::Wireless { .. } => None,
        }
    }

    /// Points the station radiates from: every DTS site, or the single
    /// station location.
    pub fn sites(&self) -> &[GeoPoint] {
        match &self.kind {
            FacilityKind::Tv { dts_sites, .. } if !dts_sites.is_empty() => dts_sites.as_slice(),
            _ => std::slice::from_ref(&self.location),
        }
    }

    pub fn band(&self) -> Band {
        match self.kind {
            FacilityKind::Tv { channel, .. } if channel < 7 => Band::VhfLow,
            FacilityKind::Tv { channel, .. } if channel < 14 => Band::VhfHigh,
            FacilityKind::Tv { .. } | FacilityKind::Wireless { .. } => Band::Uhf,
            FacilityKind::Fm { .. } => Band::Fm,
        }
    }

    /// Class key used to look up a service contour level.
    pub fn station_class(&self) -> Option<&str> {
        match &self.kind {
            FacilityKind::Fm { station_class, .. } => Some(station_class.as_str()),
            _ => None,
        }
    }

    /// Check the attributes a source must carry to take part in a study.
    pub fn validate(&self) -> Result<(), String> {
        if !self.location.is_valid() {
            return Err(format!(
                "invalid location {:.6},{:.6}",
                self.location.latitude, self.location.longitude
            ));
        }
        if !(self.erp_kw.is_finite() && self.erp_kw > 0.0) {
            return Err(format!("invalid ERP {} kW", self.erp_kw));
        }
        match &self.kind {
            FacilityKind::Tv { channel, dts_sites } => {
                if !(TV_CHANNEL_MIN..=TV_CHANNEL_MAX).contains(channel) {
                    return Err(format!("TV channel {channel} out of range"));
                }
                if dts_sites.iter().any(|site| !site.is_valid()) {
                    return Err("invalid DTS site location".to_string());
                }
            }
            FacilityKind::Fm { channel, .. } => {
                if !(FM_CHANNEL_MIN..=FM_CHANNEL_MAX).contains(channel) {
                    return Err(format!("FM channel {channel} out of range"));
                }
            }
            FacilityKind::Wireless { sector_id } => {
                if sector_id.trim().is_empty() {
                    return Err("wireless record has no sector id".to_string());
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 4. External records
// ---------------------------------------------------------------------------

/// Natural identity of a record in an external station database.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalKey {
    pub dataset_id: i32,
    pub record_id: String,
}

impl ExternalKey {
    pub fn new(dataset_id: i32, record_id: impl Into<String>) -> Self {
        Self {
            dataset_id,
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for ExternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset_id, self.record_id)
    }
}

/// Candidate record delivered by the external-record-search collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub key: ExternalKey,
    #[serde(default = "default_locked")]
    pub is_locked: bool,
    pub facility: Facility,
}

fn default_locked() -> bool {
    true
}

impl ExternalRecord {
    pub fn new(key: ExternalKey, facility: Facility) -> Self {
        Self {
            key,
            is_locked: true,
            facility,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.facility.record_type()
    }
}

// ---------------------------------------------------------------------------
// 5. Sources
// ---------------------------------------------------------------------------

/// Sharing identity of a source. The variants are exclusive: a source is
/// tied to an external record, to a user-entered record, or to neither.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Sharing {
    Private,
    External(ExternalKey),
    User { user_record_id: i64 },
}

/// Canonical engineering record of one station within a study.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub is_locked: bool,
    pub sharing: Sharing,
    /// Set on replication sources; names the source this one was copied from.
    #[serde(default)]
    pub original_id: Option<SourceId>,
    pub facility: Facility,
    #[serde(default)]
    pub mod_count: u64,
}

impl Source {
    /// Derive a locked source mirroring an external record.
    pub fn from_external(id: SourceId, record: &ExternalRecord) -> Result<Self, String> {
        if !record.is_locked {
            return Err("external candidates must be locked".to_string());
        }
        if record.key.record_id.trim().is_empty() {
            return Err("external record id is empty".to_string());
        }
        record.facility.validate()?;
        Ok(Self {
            id,
            is_locked: true,
            sharing: Sharing::External(record.key.clone()),
            original_id: None,
            facility: record.facility.clone(),
            mod_count: 0,
        })
    }

    /// Locked source for a user-entered record, shareable by its user id.
    pub fn from_user_record(
        id: SourceId,
        user_record_id: i64,
        facility: Facility,
    ) -> Result<Self, String> {
        facility.validate()?;
        Ok(Self {
            id,
            is_locked: true,
            sharing: Sharing::User { user_record_id },
            original_id: None,
            facility,
            mod_count: 0,
        })
    }

    /// Unlocked source private to one study.
    pub fn private(id: SourceId, facility: Facility) -> Result<Self, String> {
        facility.validate()?;
        Ok(Self {
            id,
            is_locked: false,
            sharing: Sharing::Private,
            original_id: None,
            facility,
            mod_count: 0,
        })
    }

    /// Derive a replication of `self` onto `channel`. The replication keeps
    /// the original's sharing identity and lock state.
    pub fn replicate(&self, id: SourceId, channel: i32) -> Result<Self, String> {
        let kind = match &self.facility.kind {
            FacilityKind::Tv { dts_sites, .. } => FacilityKind::Tv {
                channel,
                dts_sites: dts_sites.clone(),
            },
            _ => {
                return Err(format!(
                    "{} sources cannot be replicated",
                    self.record_type()
                ))
            }
        };
        if self.facility.channel() == Some(channel) {
            return Err(format!("source is already on channel {channel}"));
        }
        let facility = Facility {
            kind,
            ..self.facility.clone()
        };
        facility.validate()?;
        Ok(Self {
            id,
            is_locked: self.is_locked,
            sharing: self.sharing.clone(),
            original_id: Some(self.id),
            facility,
            mod_count: 0,
        })
    }

    /// Editable private copy of this source under a new id.
    pub fn unlocked_copy(&self, id: SourceId) -> Self {
        Self {
            id,
            is_locked: false,
            sharing: Sharing::Private,
            original_id: None,
            facility: self.facility.clone(),
            mod_count: 0,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.facility.record_type()
    }

    pub fn is_replication(&self) -> bool {
        self.original_id.is_some()
    }

    pub fn external_key(&self) -> Option<&ExternalKey> {
        match &self.sharing {
            Sharing::External(key) => Some(key),
            _ => None,
        }
    }

    pub fn user_record_id(&self) -> Option<i64> {
        match self.sharing {
            Sharing::User { user_record_id } => Some(user_record_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// 6. Scenario membership
// ---------------------------------------------------------------------------

/// One membership entry of a scenario.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceListItem {
    pub source_id: SourceId,
    pub is_desired: bool,
    pub is_undesired: bool,
    #[serde(default)]
    pub is_permanent: bool,
}

impl SourceListItem {
    pub fn new(source_id: SourceId, is_desired: bool, is_undesired: bool) -> Self {
        Self {
            source_id,
            is_desired,
            is_undesired,
            is_permanent: false,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn tv_facility(channel: i32, location: GeoPoint) -> Facility {
        Facility {
            call_sign: format!("KTV{channel}"),
            facility_id: 1000 + i64::from(channel),
            service: Service {
                code: "DT".to_string(),
                service_type: 1,
                preference_rank: 3,
            },
            country: Country::Us,
            status: StatusType::License,
            location,
            erp_kw: 1000.0,
            haat_m: 300.0,
            kind: FacilityKind::Tv {
                channel,
                dts_sites: Vec::new(),
            },
        }
    }

    pub fn fm_facility(facility_id: i64, channel: i32, location: GeoPoint) -> Facility {
        Facility {
            call_sign: format!("KFM{facility_id}"),
            facility_id,
            service: Service {
                code: "FM".to_string(),
                service_type: 20,
                preference_rank: 2,
            },
            country: Country::Us,
            status: StatusType::License,
            location,
            erp_kw: 50.0,
            haat_m: 150.0,
            kind: FacilityKind::Fm {
                channel,
                station_class: "B".to_string(),
            },
        }
    }

    pub fn record(dataset_id: i32, record_id: &str, facility: Facility) -> ExternalRecord {
        ExternalRecord::new(ExternalKey::new(dataset_id, record_id), facility)
    }

    pub fn id(raw: u16) -> SourceId {
        SourceId::new(raw).unwrap()
    }
}
