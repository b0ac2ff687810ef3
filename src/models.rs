use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Code used when a country could not be resolved against the reference list.
pub const UNRESOLVED_CODE: &str = "??";

/// Flag shown for a country nobody could place.
pub const GLOBE_FLAG: &str = "🌍";

/// One spreadsheet row or form submission, keyed by whatever header the
/// source used. Header variants are absorbed by the alias tables below.
pub type RawRow = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub name: String,
    pub flag: String,
    pub code: String,
}

impl Country {
    pub fn is_resolved(&self) -> bool {
        self.code != UNRESOLVED_CODE
    }
}

impl Default for Country {
    fn default() -> Self {
        Self {
            name: "Unknown".into(),
            flag: GLOBE_FLAG.into(),
            code: UNRESOLVED_CODE.into(),
        }
    }
}

/// Canonical participant record. Field names serialize in the camelCase
/// form the hosted table uses, so a round trip through the persistence
/// layer is loss-free.
///
/// `search_name` and `search_org` are derived by the record normalizer and
/// are never taken from input; a record whose search fields were not freshly
/// derived has not passed through [`crate::record::normalize_record`] and
/// must not be treated as canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Participant {
    /// Assigned by the persistence layer; empty until first insert.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    pub title: String,
    pub organization: String,
    pub org_description: String,
    pub short_bio: String,
    pub testimony: String,
    pub other_info: String,
    pub phone: String,
    pub email: String,
    pub contact_email: String,
    pub website: String,
    pub upcoming_events: String,
    pub dietary_restrictions: String,
    /// Residency. Resolved independently of `nationality`.
    pub country: Country,
    /// Heritage. Not required to match `country`.
    pub nationality: Country,
    pub photo_url: String,
    pub promo_photo_url: String,
    pub search_name: String,
    pub search_org: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

// Ordered header aliases per canonical field. Lookup takes the first key
// present with a non-empty value, so new sheet header variants are additive.
// The camelCase entries cover rows that came back out of the hosted table.

pub const NAME_ALIASES: &[&str] = &["Full Name", "Name", "name"];

pub const TITLE_ALIASES: &[&str] = &[
    "Role(s) in the organization",
    "Role",
    "Title",
    "Position",
    "title",
    "role",
];

pub const ORGANIZATION_ALIASES: &[&str] = &[
    "Name of Ministry/Church/Organization/Business",
    "Church / Organization",
    "Organization",
    "Ministry",
    "Church",
    "organization",
    "church",
];

pub const ORG_DESCRIPTION_ALIASES: &[&str] = &[
    "Description of your organization",
    "Description",
    "Org Description",
    "orgDescription",
    "description",
];

pub const TESTIMONY_ALIASES: &[&str] =
    &["Short biography", "Bio", "Testimony", "testimony", "bio"];

pub const SHORT_BIO_ALIASES: &[&str] = &["Short Bio", "shortBio"];

pub const OTHER_INFO_ALIASES: &[&str] = &["Other", "Other Information", "otherInfo", "other"];

pub const PHONE_ALIASES: &[&str] = &["Phone Number", "Phone number", "Phone", "phone"];

pub const EMAIL_ALIASES: &[&str] = &["Email Address", "Email", "Email address", "email"];

pub const CONTACT_EMAIL_ALIASES: &[&str] = &["Contact Email", "contactEmail"];

pub const WEBSITE_ALIASES: &[&str] = &["Website", "website"];

pub const UPCOMING_EVENTS_ALIASES: &[&str] = &["Upcoming Events", "upcomingEvents"];

pub const DIETARY_ALIASES: &[&str] = &[
    "Dietary Restrictions",
    "Dietary restrictions",
    "dietaryRestrictions",
];

pub const COUNTRY_ALIASES: &[&str] = &["Country", "Location", "Residency", "country"];

pub const NATIONALITY_ALIASES: &[&str] = &["Nationality", "Country", "Location", "nationality"];

pub const PHOTO_ALIASES: &[&str] = &[
    "Profile Picture of You",
    "Profile picture",
    "Photo URL",
    "Photo",
    "photoUrl",
];

pub const PROMO_PHOTO_ALIASES: &[&str] = &[
    "Promotional Picture",
    "Promo picture",
    "Promo Photo",
    "Promo",
    "promoPhotoUrl",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_country_is_the_unresolved_sentinel() {
        let c = Country::default();
        assert_eq!(c.code, UNRESOLVED_CODE);
        assert!(!c.is_resolved());
    }

    #[test]
    fn test_participant_serializes_with_camel_case_columns() {
        let p = Participant {
            id: "A1".into(),
            name: "Test".into(),
            search_name: "TEST".into(),
            photo_url: "https://example.com/p.jpg".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"searchName\":\"TEST\""));
        assert!(json.contains("\"photoUrl\""));
        assert!(!json.contains("search_name"));
    }

    #[test]
    fn test_participant_round_trips_through_json() {
        let p = Participant {
            id: "A1".into(),
            name: "Ada".into(),
            email: "ada@example.org".into(),
            country: Country {
                name: "Germany".into(),
                flag: "🇩🇪".into(),
                code: "DE".into(),
            },
            ..Default::default()
        };
        let back: Participant = serde_json::from_str(&serde_json::to_string(&p).unwrap()).unwrap();
        assert_eq!(back, p);
    }
}
