use std::collections::BTreeSet;

use regex::Regex;
use sdlc_contracts::{Entity, PACKAGE_SEPARATOR, SdlcError};
use serde_json::Value;

use crate::decode::{EntityRead, InvalidEntity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFilterParams {
    pub classifier_paths: Vec<String>,
    pub packages: Vec<String>,
    pub include_sub_packages: bool,
    pub name_regex: Option<String>,
    pub stereotypes: Vec<String>,
    pub tagged_value_regexes: Vec<String>,
    pub exclude_invalid: bool,
}

impl Default for EntityFilterParams {
    fn default() -> Self {
        Self {
            classifier_paths: Vec::new(),
            packages: Vec::new(),
            include_sub_packages: true,
            name_regex: None,
            stereotypes: Vec::new(),
            tagged_value_regexes: Vec::new(),
            exclude_invalid: false,
        }
    }
}

/// A `PROFILE.NAME` reference to a stereotype or tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProfileRef {
    pub profile: String,
    pub name: String,
}

impl ProfileRef {
    /// Splits at the last `.`; profile paths use `::` and never contain `.`.
    pub fn parse(raw: &str) -> Result<Self, SdlcError> {
        let raw = raw.trim();
        if raw.contains('/') {
            return Err(SdlcError::bad_request(format!(
                "invalid profile reference \"{}\": must not contain '/'",
                raw
            )));
        }

        let (profile, name) = raw.rsplit_once('.').ok_or_else(|| {
            SdlcError::bad_request(format!(
                "invalid profile reference \"{}\": expected PROFILE.NAME",
                raw
            ))
        })?;

        if profile.is_empty() || name.is_empty() {
            return Err(SdlcError::bad_request(format!(
                "invalid profile reference \"{}\": expected PROFILE.NAME",
                raw
            )));
        }

        Ok(Self {
            profile: profile.to_string(),
            name: name.to_string(),
        })
    }

    fn matches_pointer(&self, profile: Option<&Value>, name: Option<&Value>) -> bool {
        profile.and_then(Value::as_str) == Some(self.profile.as_str())
            && name.and_then(Value::as_str) == Some(self.name.as_str())
    }
}

impl std::fmt::Display for ProfileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.profile, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct TaggedValueRegex {
    pub tag: ProfileRef,
    pub pattern: String,
    regex: Regex,
}

impl TaggedValueRegex {
    pub fn parse(raw: &str) -> Result<Self, SdlcError> {
        let (tag, pattern) = raw.split_once('/').ok_or_else(|| {
            SdlcError::bad_request(format!(
                "invalid tagged value filter \"{}\": expected PROFILE.NAME/REGEX",
                raw
            ))
        })?;

        let tag = ProfileRef::parse(tag)?;
        let regex = compile_full_match(pattern, "tagged value")?;

        Ok(Self {
            tag,
            pattern: pattern.to_string(),
            regex,
        })
    }

    fn matches(&self, entity: &Entity) -> bool {
        entity.tagged_values().iter().any(|tagged_value| {
            let tag = tagged_value.get("tag");
            self.tag.matches_pointer(
                tag.and_then(|t| t.get("profile")),
                tag.and_then(|t| t.get("value")),
            ) && tagged_value
                .get("value")
                .and_then(Value::as_str)
                .is_some_and(|value| self.regex.is_match(value))
        })
    }
}

#[derive(Debug, Clone)]
pub struct EntityFilter {
    classifier_paths: BTreeSet<String>,
    packages: BTreeSet<String>,
    include_sub_packages: bool,
    name: Option<Regex>,
    stereotypes: BTreeSet<ProfileRef>,
    tagged_values: Vec<TaggedValueRegex>,
    exclude_invalid: bool,
}

impl EntityFilter {
    pub fn compile(params: &EntityFilterParams) -> Result<Self, SdlcError> {
        let name = params
            .name_regex
            .as_deref()
            .map(|raw| compile_full_match(raw, "name"))
            .transpose()?;

        let stereotypes = params
            .stereotypes
            .iter()
            .map(|raw| ProfileRef::parse(raw))
            .collect::<Result<BTreeSet<_>, _>>()?;

        let tagged_values = params
            .tagged_value_regexes
            .iter()
            .map(|raw| TaggedValueRegex::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            classifier_paths: params.classifier_paths.iter().cloned().collect(),
            packages: params.packages.iter().cloned().collect(),
            include_sub_packages: params.include_sub_packages,
            name,
            stereotypes,
            tagged_values,
            exclude_invalid: params.exclude_invalid,
        })
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        self.matches_classifier(entity)
            && self.matches_package(entity)
            && self.matches_name(entity)
            && self.matches_stereotypes(entity)
            && self.matches_tagged_values(entity)
    }

    pub fn matches_classifier(&self, entity: &Entity) -> bool {
        self.classifier_paths.is_empty() || self.classifier_paths.contains(&entity.classifier_path)
    }

    pub fn matches_package(&self, entity: &Entity) -> bool {
        if self.packages.is_empty() {
            return true;
        }

        let package = entity.package();
        self.packages.iter().any(|p| {
            package == p
                || (self.include_sub_packages
                    && package
                        .strip_prefix(p.as_str())
                        .is_some_and(|rest| rest.starts_with(PACKAGE_SEPARATOR)))
        })
    }

    pub fn matches_name(&self, entity: &Entity) -> bool {
        self.name
            .as_ref()
            .is_none_or(|regex| regex.is_match(entity.name()))
    }

    pub fn matches_stereotypes(&self, entity: &Entity) -> bool {
        if self.stereotypes.is_empty() {
            return true;
        }

        entity.stereotypes().iter().any(|stereotype| {
            self.stereotypes.iter().any(|wanted| {
                wanted.matches_pointer(stereotype.get("profile"), stereotype.get("value"))
            })
        })
    }

    pub fn matches_tagged_values(&self, entity: &Entity) -> bool {
        self.tagged_values.iter().all(|filter| filter.matches(entity))
    }

    pub fn apply<I>(&self, reads: I) -> Result<Vec<Entity>, SdlcError>
    where
        I: IntoIterator<Item = EntityRead>,
    {
        let mut kept = Vec::new();
        let mut invalid = Vec::new();

        for read in reads {
            match read {
                EntityRead::Valid(entity) => {
                    if self.matches(&entity) {
                        kept.push(entity);
                    }
                }
                EntityRead::Invalid(marker) => invalid.push(marker),
            }
        }

        if !invalid.is_empty() && !self.exclude_invalid {
            return Err(invalid_entities_error(&invalid));
        }

        Ok(kept)
    }
}

pub fn invalid_entities_error(invalid: &[InvalidEntity]) -> SdlcError {
    let paths = invalid
        .iter()
        .map(|marker| marker.path.as_str())
        .collect::<Vec<_>>();
    let reasons = invalid
        .iter()
        .map(|marker| format!("{}: {}", marker.path, marker.reason))
        .collect::<Vec<_>>();

    SdlcError::invalid_entity(format!(
        "{} invalid entit{}: {}",
        invalid.len(),
        if invalid.len() == 1 { "y" } else { "ies" },
        paths.join(", ")
    ))
    .with_cause(reasons.join("; "))
}

fn compile_full_match(raw: &str, what: &str) -> Result<Regex, SdlcError> {
    // Validate the pattern on its own first so the error names the caller's
    // text rather than the anchored wrapper.
    Regex::new(raw).map_err(|err| {
        SdlcError::bad_request(format!("invalid {} regex \"{}\"", what, raw))
            .with_cause(err.to_string())
    })?;

    Regex::new(&format!("^(?:{})$", raw)).map_err(|err| {
        SdlcError::bad_request(format!("invalid {} regex \"{}\"", what, raw))
            .with_cause(err.to_string())
    })
}
