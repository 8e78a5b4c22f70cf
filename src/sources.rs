//! Published CSV sources and the field maps that normalize them.

use crate::normalize::{FieldMap, FieldSpec, RowFilter, ValueSpec};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const GCB_AVERAGES_FILE: &str = "generic_ballot_averages.csv";
pub const GCB_POLLS_FILE: &str = "generic_ballot_polls.csv";

/// A legislative or executive body with published forecasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chamber {
    Senate,
    House,
    Governor,
}

impl Chamber {
    pub const ALL: [Chamber; 3] = [Chamber::Senate, Chamber::House, Chamber::Governor];

    pub fn name(&self) -> &'static str {
        match self {
            Chamber::Senate => "senate",
            Chamber::House => "house",
            Chamber::Governor => "governor",
        }
    }

    /// National topline file. Governors have none.
    pub fn national_file(&self) -> Option<&'static str> {
        match self {
            Chamber::Senate => Some("senate_national_toplines_2022.csv"),
            Chamber::House => Some("house_national_toplines_2022.csv"),
            Chamber::Governor => None,
        }
    }

    pub fn district_file(&self) -> &'static str {
        match self {
            Chamber::Senate => "senate_state_toplines_2022.csv",
            Chamber::House => "house_district_toplines_2022.csv",
            Chamber::Governor => "governor_state_toplines_2022.csv",
        }
    }

    /// Statewide races are keyed by a two-letter state prefix.
    pub fn is_statewide(&self) -> bool {
        matches!(self, Chamber::Senate | Chamber::Governor)
    }
}

impl fmt::Display for Chamber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Generic-ballot polls, one row per poll question.
///
/// Identity is the pollster tuple polls are grouped on. `population` is
/// uppercased because the source mixes `lv` and `LV`.
pub fn gcb_polls(election_date: &str) -> FieldMap {
    FieldMap {
        identity: vec![
            FieldSpec::new("pollsterName", "display_name"),
            FieldSpec::new("fteGrade", "fte_grade").or_default("Unrated"),
            FieldSpec::new("sponsor", "sponsors").or_default(""),
            FieldSpec::new("population", "population")
                .or_default("Not Specified")
                .uppercased(),
            FieldSpec::new("partisan", "partisan").or_default(""),
        ],
        labels: vec![
            FieldSpec::new("poll_id", "poll_id"),
            FieldSpec::new("methodology", "methodology").or_default("Not Specified"),
        ],
        values: vec![ValueSpec::new("dem", "dem"), ValueSpec::new("rep", "rep")],
        start_date: Some("start_date".to_string()),
        end_date: Some("end_date".to_string()),
        variant: None,
        filters: vec![RowFilter::equals("election_date", election_date)],
    }
}

/// Generic-ballot polls with the pollster details a new-poll message shows.
///
/// Identity is `(poll_id, population)`, so the RV and LV rows of one poll
/// stay separate records.
pub fn poll_details(election_date: &str) -> FieldMap {
    FieldMap {
        identity: vec![
            FieldSpec::new("poll_id", "poll_id"),
            FieldSpec::new("population", "population")
                .or_default("Not Specified")
                .uppercased(),
        ],
        labels: vec![
            FieldSpec::new("pollster_id", "pollster_id"),
            FieldSpec::new("pollsterName", "display_name"),
            FieldSpec::new("fteGrade", "fte_grade").or_default("Unrated"),
            FieldSpec::new("methodology", "methodology").or_default("Not Specified"),
            FieldSpec::new("sponsor_ids", "sponsor_ids").or_default("No Sponsor"),
            FieldSpec::new("sponsors", "sponsors").or_default("No Sponsor"),
            FieldSpec::new("partisan", "partisan").or_default(""),
            FieldSpec::new("internal", "internal").or_default(""),
            FieldSpec::new("sample_size", "sample_size").or_default("0"),
        ],
        values: vec![ValueSpec::new("dem", "dem"), ValueSpec::new("rep", "rep")],
        start_date: Some("start_date".to_string()),
        end_date: Some("end_date".to_string()),
        variant: None,
        filters: vec![RowFilter::equals("election_date", election_date)],
    }
}

/// The same polls with `population` as the variant tag, for RV/LV pairing.
pub fn gcb_polls_by_population(election_date: &str) -> FieldMap {
    let mut map = gcb_polls(election_date);
    map.identity.retain(|f| f.name != "population");
    map.variant = Some(
        FieldSpec::new("population", "population")
            .or_default("Not Specified")
            .uppercased(),
    );
    map
}

/// Daily generic-ballot averages, one row per party per day.
pub fn gcb_averages(election: &str) -> FieldMap {
    FieldMap {
        identity: vec![],
        labels: vec![],
        values: vec![ValueSpec::new("pct", "pct_estimate")],
        start_date: Some("date".to_string()),
        end_date: None,
        variant: Some(FieldSpec::new("candidate", "candidate")),
        filters: vec![RowFilter::equals("election", election)],
    }
}

/// National chamber toplines, one row per model expression per run.
pub fn national_toplines() -> FieldMap {
    FieldMap {
        identity: vec![FieldSpec::new("expression", "expression")],
        labels: vec![],
        values: vec![
            ValueSpec::new("probD", "chamber_Dparty"),
            ValueSpec::new("probR", "chamber_Rparty"),
            ValueSpec::new("seatsD", "median_seats_Dparty"),
            ValueSpec::new("seatsR", "median_seats_Rparty"),
        ],
        start_date: None,
        end_date: None,
        variant: None,
        filters: vec![],
    }
}

/// District (or state) toplines with the model expression as the variant.
pub fn district_toplines() -> FieldMap {
    FieldMap {
        identity: vec![FieldSpec::new("district", "district")],
        labels: vec![
            FieldSpec::new("nameD", "name_D1").or_default(""),
            FieldSpec::new("nameR", "name_R1").or_default(""),
        ],
        values: vec![
            ValueSpec::new("probD", "winner_Dparty"),
            ValueSpec::new("probR", "winner_Rparty").or_default(0.0),
            ValueSpec::new("margin", "mean_netpartymargin").or_default(0.0),
        ],
        start_date: None,
        end_date: None,
        variant: Some(FieldSpec::new("expression", "expression")),
        filters: vec![],
    }
}
