use sdlc_contracts::{PACKAGE_SEPARATOR, SdlcError};

const ENTITY_FILE_EXTENSION: &str = ".json";

/// `entities/a/sub/C.json` with root `entities` maps to `a::sub::C`.
pub fn entity_path_for_file(root: &str, file_path: &str) -> Option<String> {
    let root = root.trim_matches('/');
    let relative = if root.is_empty() {
        file_path
    } else {
        file_path.strip_prefix(root)?.strip_prefix('/')?
    };

    let stem = relative.strip_suffix(ENTITY_FILE_EXTENSION)?;
    let segments = stem.split('/').collect::<Vec<_>>();
    if segments
        .iter()
        .any(|s| s.is_empty() || s.contains(PACKAGE_SEPARATOR))
    {
        return None;
    }

    Some(segments.join(PACKAGE_SEPARATOR))
}

pub fn file_path_for_entity(root: &str, entity_path: &str) -> Result<String, SdlcError> {
    validate_entity_path(entity_path)?;

    let relative = entity_path.split(PACKAGE_SEPARATOR).collect::<Vec<_>>().join("/");
    let root = root.trim_matches('/');
    if root.is_empty() {
        Ok(format!("{}{}", relative, ENTITY_FILE_EXTENSION))
    } else {
        Ok(format!("{}/{}{}", root, relative, ENTITY_FILE_EXTENSION))
    }
}

pub fn validate_entity_path(entity_path: &str) -> Result<(), SdlcError> {
    if entity_path.trim().is_empty() {
        return Err(SdlcError::bad_request("entity path must be non-empty"));
    }

    if entity_path.contains('/') || entity_path.contains('\\') {
        return Err(SdlcError::bad_request(format!(
            "invalid entity path \"{}\": must not contain path delimiters",
            entity_path
        )));
    }

    if entity_path
        .split(PACKAGE_SEPARATOR)
        .any(|segment| segment.is_empty() || segment.trim() != segment)
    {
        return Err(SdlcError::bad_request(format!(
            "invalid entity path \"{}\"",
            entity_path
        )));
    }

    Ok(())
}
