use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Filter text meaning "no filter on this attribute". Matched case-insensitively.
pub const SENTINEL_NAMES: &[&str] = &["TeGjitha", "All"];

/// A cell or argument that names no member of a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{value}' is not a valid {kind}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! closed_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every member, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| UnknownVariant {
                        kind: stringify!($name),
                        value: s.to_string(),
                    })
            }
        }
    };
}

closed_enum! {
    /// Ballot category (`Kategoria`). `TeGjitha` is only a wildcard when used as a filter.
    Category {
        TeGjitha,
        Local,
        Conditional,
        Postal,
        Mobile,
    }
}

closed_enum! {
    /// Municipality (`Komuna`). `TeGjitha` is only a wildcard when used as a filter.
    Municipality {
        TeGjitha,
        Decan,
        Dragash,
        Ferizaj,
        FusheKosove,
        Gjakove,
        Gjilan,
        Gllogoc,
        Gracanice,
        HaniIElezit,
        Istog,
        Junik,
        Kacanik,
        Kamenice,
        Kline,
        Kllokot,
        Leposaviq,
        Lipjan,
        Malisheve,
        Mamushe,
        Mitrovice,
        MitroviceVeriore,
        Novoberde,
        Obiliq,
        Partesh,
        Peje,
        Podujeve,
        Prishtine,
        Prizren,
        Rahovec,
        Ranillug,
        Shterpce,
        Shtime,
        Skenderaj,
        Suhareke,
        Viti,
        Vushtrri,
        ZubinPotok,
        Zvecan,
    }
}

closed_enum! {
    /// Party vote columns. Declaration order is the report order.
    Party {
        Partia111, Partia112, Partia113, Partia114, Partia115, Partia116, Partia117,
        Partia118, Partia119, Partia120, Partia121, Partia122, Partia123, Partia124,
        Partia125, Partia126, Partia127, Partia128, Partia129, Partia130, Partia131,
        Partia132, Partia133, Partia134, Partia135, Partia136, Partia137, Partia138,
    }
}

pub const PARTY_COUNT: usize = 28;

impl Party {
    pub fn index(self) -> usize {
        self as usize
    }

    /// Lowercase name used for SQL columns and index document fields.
    pub fn field_name(self) -> String {
        self.as_str().to_ascii_lowercase()
    }
}

/// Returns true when `raw` is the "no filter" sentinel.
pub fn is_sentinel(raw: &str) -> bool {
    let raw = raw.trim();
    SENTINEL_NAMES.iter().any(|s| s.eq_ignore_ascii_case(raw))
}

/// Parse an optional enum filter. Absent, blank and sentinel values all mean "no filter".
pub fn parse_filter<T>(raw: Option<&str>) -> Result<Option<T>, UnknownVariant>
where
    T: FromStr<Err = UnknownVariant>,
{
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) if is_sentinel(s) => Ok(None),
        Some(s) => s.parse().map(Some),
    }
}

/// Vote counts for every party column, indexed by declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartyVotes([u32; PARTY_COUNT]);

impl PartyVotes {
    pub fn get(&self, party: Party) -> u32 {
        self.0[party.index()]
    }

    pub fn set(&mut self, party: Party, votes: u32) {
        self.0[party.index()] = votes;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Party, u32)> + '_ {
        Party::ALL.iter().map(move |p| (*p, self.get(*p)))
    }
}

/// One polling-station/category observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionRecord {
    pub category: Category,
    pub municipality: Municipality,
    pub polling_center: String,
    pub polling_place: String,
    pub votes: PartyVotes,
}

impl ElectionRecord {
    pub fn new(category: Category, municipality: Municipality) -> Self {
        Self {
            category,
            municipality,
            polling_center: String::new(),
            polling_place: String::new(),
            votes: PartyVotes::default(),
        }
    }

    pub fn with_polling_center(mut self, polling_center: impl Into<String>) -> Self {
        self.polling_center = polling_center.into();
        self
    }

    pub fn with_polling_place(mut self, polling_place: impl Into<String>) -> Self {
        self.polling_place = polling_place.into();
        self
    }

    pub fn with_votes(mut self, party: Party, votes: u32) -> Self {
        self.votes.set(party, votes);
        self
    }
}

/// A record together with its record-store row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: i64,
    pub record: ElectionRecord,
}

/// Query-side filters shared by store-backed and index-backed aggregation.
/// `None` means "no filter"; sentinel handling happens when the filter is parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultFilter {
    pub category: Option<Category>,
    pub municipality: Option<Municipality>,
    pub polling_center: Option<String>,
    pub polling_place: Option<String>,
    pub party: Option<Party>,
}

impl ResultFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_municipality(mut self, municipality: Municipality) -> Self {
        self.municipality = Some(municipality);
        self
    }

    pub fn with_polling_center(mut self, polling_center: impl Into<String>) -> Self {
        self.polling_center = Some(polling_center.into());
        self
    }

    pub fn with_polling_place(mut self, polling_place: impl Into<String>) -> Self {
        self.polling_place = Some(polling_place.into());
        self
    }

    pub fn with_party(mut self, party: Party) -> Self {
        self.party = Some(party);
        self
    }

    /// Whitespace-only text filters are treated as absent. Values are otherwise kept verbatim.
    pub fn normalized(mut self) -> Self {
        if self.polling_center.as_deref().is_some_and(|s| s.trim().is_empty()) {
            self.polling_center = None;
        }
        if self.polling_place.as_deref().is_some_and(|s| s.trim().is_empty()) {
            self.polling_place = None;
        }
        self
    }
}

/// Summed votes for one party column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartyTotal {
    #[serde(rename = "partia")]
    pub party: Party,
    #[serde(rename = "totalVota")]
    pub total_votes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedResponse {
    pub results: Vec<PartyTotal>,
}

/// One row of the suggestion ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuggestionStat {
    #[serde(rename = "komuna")]
    pub name: String,
    #[serde(rename = "nrISugjerimeve")]
    pub hits: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_declaration_order() {
        assert_eq!(Party::ALL.len(), PARTY_COUNT);
        assert_eq!(Party::ALL[0], Party::Partia111);
        assert_eq!(Party::ALL[PARTY_COUNT - 1], Party::Partia138);
        for (i, party) in Party::ALL.iter().enumerate() {
            assert_eq!(party.index(), i);
            assert_eq!(party.as_str(), format!("Partia{}", 111 + i));
        }
    }

    #[test]
    fn enum_parse_is_case_insensitive() {
        assert_eq!("prishtine".parse::<Municipality>().unwrap(), Municipality::Prishtine);
        assert_eq!(" LOCAL ".parse::<Category>().unwrap(), Category::Local);
        assert_eq!("partia120".parse::<Party>().unwrap(), Party::Partia120);
    }

    #[test]
    fn enum_parse_rejects_unknown() {
        let err = "Atlantis".parse::<Municipality>().unwrap_err();
        assert_eq!(err.kind, "Municipality");
        assert_eq!(err.to_string(), "'Atlantis' is not a valid Municipality");
    }

    #[test]
    fn sentinel_parses_as_data() {
        assert_eq!("TeGjitha".parse::<Category>().unwrap(), Category::TeGjitha);
    }

    #[test]
    fn parse_filter_sentinel_is_none() {
        assert_eq!(parse_filter::<Category>(Some("TeGjitha")).unwrap(), None);
        assert_eq!(parse_filter::<Category>(Some("all")).unwrap(), None);
        assert_eq!(parse_filter::<Party>(Some("  ")).unwrap(), None);
        assert_eq!(parse_filter::<Party>(None).unwrap(), None);
        assert_eq!(
            parse_filter::<Municipality>(Some("Peje")).unwrap(),
            Some(Municipality::Peje)
        );
        assert!(parse_filter::<Party>(Some("Partia999")).is_err());
    }

    #[test]
    fn party_votes_iterates_in_order() {
        let mut votes = PartyVotes::default();
        votes.set(Party::Partia112, 7);
        let collected: Vec<_> = votes.iter().take(3).collect();
        assert_eq!(
            collected,
            vec![(Party::Partia111, 0), (Party::Partia112, 7), (Party::Partia113, 0)]
        );
    }

    #[test]
    fn normalized_drops_blank_text_filters() {
        let filter = ResultFilter::new()
            .with_polling_center("   ")
            .with_polling_place(" Shkolla ")
            .normalized();
        assert_eq!(filter.polling_center, None);
        assert_eq!(filter.polling_place.as_deref(), Some(" Shkolla "));
    }

    #[test]
    fn response_shapes_use_api_field_names() {
        let total = PartyTotal {
            party: Party::Partia111,
            total_votes: 35,
        };
        let json = serde_json::to_value(AggregatedResponse {
            results: vec![total],
        })
        .unwrap();
        assert_eq!(json["results"][0]["partia"], "Partia111");
        assert_eq!(json["results"][0]["totalVota"], 35);

        let stat = serde_json::to_value(SuggestionStat {
            name: "Prizren".to_string(),
            hits: 4,
        })
        .unwrap();
        assert_eq!(stat["komuna"], "Prizren");
        assert_eq!(stat["nrISugjerimeve"], 4);
    }
}
