use quick_xml::DeError;
use serde::Deserialize;

/// Root of both the planned and the changes documents.
#[derive(Debug, Default, Deserialize)]
#[serde(rename = "timetable")]
pub struct Timetable {
    #[serde(rename = "@station")]
    pub station: Option<String>,
    #[serde(rename = "@eva")]
    pub eva: Option<String>,
    #[serde(rename = "s", default)]
    pub stops: Vec<TimetableStop>,
}

/// One per-train record (`<s>`).
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TimetableStop {
    // Optional so that a single broken record does not fail the whole document.
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "tl")]
    pub trip_label: Option<TripLabel>,
    #[serde(rename = "ar")]
    pub arrival: Option<StopEvent>,
    #[serde(rename = "dp")]
    pub departure: Option<StopEvent>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct TripLabel {
    #[serde(rename = "@c")]
    pub category: Option<String>, // ICE, RE, S, ...
    #[serde(rename = "@n")]
    pub number: Option<String>,
}

/// Arrival or departure event at the station.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StopEvent {
    #[serde(rename = "@pt")]
    pub planned_time: Option<String>,
    #[serde(rename = "@ct")]
    pub changed_time: Option<String>,
    #[serde(rename = "@pp")]
    pub planned_platform: Option<String>,
    #[serde(rename = "@cp")]
    pub changed_platform: Option<String>,
    #[serde(rename = "@l")]
    pub line: Option<String>,
    #[serde(rename = "@ppth")]
    pub planned_path: Option<String>,
    #[serde(rename = "@cpth")]
    pub changed_path: Option<String>,
    /// Changed status: `p` planned, `a` added, `c` cancelled.
    #[serde(rename = "@cs")]
    pub changed_status: Option<String>,
}

impl StopEvent {
    pub fn heads_to(&self, destination: &str) -> bool {
        self.planned_path
            .as_deref()
            .is_some_and(|path| path.contains(destination))
    }
}

pub fn parse_timetable(xml: &str) -> Result<Timetable, DeError> {
    quick_xml::de::from_str(xml)
}
