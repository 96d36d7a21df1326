//! Typed resource attributes and the truthy-wins merge.
//!
//! The attribute set is closed: every attribute an analyzer may emit is a
//! field declared once in [`resource_attributes!`], which generates both the
//! sparse per-file [`AttributeMapping`] (what analyzers return) and the dense
//! [`ResourceAttributes`] (what a resource holds).
//!
//! Two combination rules exist:
//! - [`AttributeMapping::overlay`] combines analyzer outputs for one file:
//!   a key present in the later mapping wins, even when its value is falsy.
//! - [`ResourceAttributes::merge`] folds a mapping into a resource: only
//!   truthy incoming values overwrite, falsy values carry no information.

use serde::{Deserialize, Serialize};

/// Truthiness of an attribute value.
///
/// `false`, zero, empty strings, empty lists and `None` are falsy.
pub trait Truthy {
    fn is_truthy(&self) -> bool;
}

impl Truthy for bool {
    fn is_truthy(&self) -> bool {
        *self
    }
}

impl Truthy for String {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthy for u64 {
    fn is_truthy(&self) -> bool {
        *self != 0
    }
}

impl Truthy for f64 {
    fn is_truthy(&self) -> bool {
        *self != 0.0 && !self.is_nan()
    }
}

impl<T> Truthy for Vec<T> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<T: Truthy> Truthy for Option<T> {
    fn is_truthy(&self) -> bool {
        self.as_ref().is_some_and(Truthy::is_truthy)
    }
}

/// One matched license rule inside a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseMatch {
    pub license_expression: String,
    pub license_expression_spdx: String,
    pub start_line: u32,
    pub end_line: u32,
    pub matcher: String,
    pub score: f64,
    pub matched_length: u32,
    pub rule_identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_text: Option<String>,
}

/// A license detection: one expression backed by one or more matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseDetection {
    pub license_expression: String,
    pub license_expression_spdx: String,
    pub identifier: String,
    pub matches: Vec<LicenseMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyrightDetection {
    pub copyright: String,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HolderDetection {
    pub holder: String,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorDetection {
    pub author: String,
    pub start_line: u32,
    pub end_line: u32,
}

macro_rules! resource_attributes {
    ($( $(#[$doc:meta])* $field:ident : $ty:ty ),+ $(,)?) => {
        /// Combined analyzer output for one file. Absent keys carry no value.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct AttributeMapping {
            $(
                $(#[$doc])*
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )+
        }

        /// Accumulated attributes of one resource.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct ResourceAttributes {
            $(
                $(#[$doc])*
                #[serde(default)]
                pub $field: $ty,
            )+
        }

        impl AttributeMapping {
            /// Every attribute name, in declaration order.
            pub const KEYS: &'static [&'static str] = &[$(stringify!($field)),+];

            /// Lay `later` over `self`. Keys present in `later` win,
            /// whatever their value.
            pub fn overlay(&mut self, later: AttributeMapping) {
                $(
                    if later.$field.is_some() {
                        self.$field = later.$field;
                    }
                )+
            }

            /// Names of the keys present in this mapping.
            pub fn keys(&self) -> Vec<&'static str> {
                let mut keys = Vec::new();
                $(
                    if self.$field.is_some() {
                        keys.push(stringify!($field));
                    }
                )+
                keys
            }

            pub fn is_empty(&self) -> bool {
                $( self.$field.is_none() )&&+
            }
        }

        impl ResourceAttributes {
            /// Fold `incoming` into these attributes. Truthy values overwrite,
            /// falsy values are ignored. Returns the names of the fields that
            /// were written.
            pub fn merge(&mut self, incoming: AttributeMapping) -> Vec<&'static str> {
                let mut applied = Vec::new();
                $(
                    if let Some(value) = incoming.$field {
                        if value.is_truthy() {
                            self.$field = value;
                            applied.push(stringify!($field));
                        }
                    }
                )+
                applied
            }
        }
    };
}

resource_attributes! {
    /// Last modification date, `YYYY-MM-DD`.
    date: String,
    sha256: String,
    mime_type: String,
    /// Human readable file type description.
    file_type: String,
    programming_language: String,
    is_binary: bool,
    is_text: bool,
    is_source: bool,
    is_script: bool,
    detected_license_expression: String,
    detected_license_expression_spdx: String,
    license_detections: Vec<LicenseDetection>,
    /// Matches too weak to count as a detection.
    license_clues: Vec<LicenseMatch>,
    percentage_of_license_text: f64,
    copyrights: Vec<CopyrightDetection>,
    holders: Vec<HolderDetection>,
    authors: Vec<AuthorDetection>,
    scan_errors: Vec<String>,
}

/// Combine analyzer outputs in configured order, later keys winning.
pub fn combine<I>(outputs: I) -> AttributeMapping
where
    I: IntoIterator<Item = AttributeMapping>,
{
    outputs
        .into_iter()
        .fold(AttributeMapping::default(), |mut acc, next| {
            acc.overlay(next);
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lgpl_detection() -> LicenseDetection {
        LicenseDetection {
            license_expression: "lgpl-2.1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_truthiness() {
        assert!(!false.is_truthy());
        assert!(!String::new().is_truthy());
        assert!(!0u64.is_truthy());
        assert!(!0.0f64.is_truthy());
        assert!(!Vec::<u8>::new().is_truthy());
        assert!(!Option::<String>::None.is_truthy());
        assert!(!Some(String::new()).is_truthy());
        assert!(Some("x".to_string()).is_truthy());
        assert!(vec![1].is_truthy());
        assert!(12u64.is_truthy());
    }

    #[test]
    fn test_merge_truthy_overwrites() {
        let mut attrs = ResourceAttributes::default();
        let applied = attrs.merge(AttributeMapping {
            license_detections: Some(vec![lgpl_detection()]),
            sha256: Some("abc".to_string()),
            ..Default::default()
        });

        assert_eq!(applied, vec!["sha256", "license_detections"]);
        assert_eq!(attrs.license_detections.len(), 1);
        assert_eq!(attrs.sha256, "abc");
    }

    #[test]
    fn test_merge_falsy_never_erases() {
        let mut attrs = ResourceAttributes::default();
        attrs.merge(AttributeMapping {
            license_detections: Some(vec![lgpl_detection()]),
            is_text: Some(true),
            ..Default::default()
        });

        let applied = attrs.merge(AttributeMapping {
            license_detections: Some(vec![]),
            is_text: Some(false),
            ..Default::default()
        });

        assert!(applied.is_empty());
        assert_eq!(attrs.license_detections, vec![lgpl_detection()]);
        assert!(attrs.is_text);
    }

    #[test]
    fn test_merge_last_truthy_wins() {
        let mut attrs = ResourceAttributes::default();
        for value in ["first", "", "second", ""] {
            attrs.merge(AttributeMapping {
                programming_language: Some(value.to_string()),
                ..Default::default()
            });
        }
        assert_eq!(attrs.programming_language, "second");
    }

    #[test]
    fn test_combine_later_key_wins_even_when_falsy() {
        let first = AttributeMapping {
            copyrights: Some(vec![CopyrightDetection {
                copyright: "Copyright (c) Foo".to_string(),
                start_line: 1,
                end_line: 1,
            }]),
            is_text: Some(true),
            ..Default::default()
        };
        let second = AttributeMapping {
            copyrights: Some(vec![]),
            ..Default::default()
        };

        let combined = combine([first, second]);
        assert_eq!(combined.copyrights, Some(vec![]));
        assert_eq!(combined.is_text, Some(true));
    }

    #[test]
    fn test_mapping_json_shape() {
        let json = r#"{"license_detections": [{"license_expression": "lgpl-2.1"}]}"#;
        let mapping: AttributeMapping = serde_json::from_str(json).unwrap();

        assert_eq!(mapping.keys(), vec!["license_detections"]);
        let out = serde_json::to_value(&mapping).unwrap();
        assert_eq!(out.as_object().unwrap().len(), 1);
        assert_eq!(
            out["license_detections"][0]["license_expression"],
            "lgpl-2.1"
        );
    }

    #[test]
    fn test_empty_mapping() {
        assert!(AttributeMapping::default().is_empty());
        assert!(AttributeMapping::KEYS.contains(&"scan_errors"));
    }
}
