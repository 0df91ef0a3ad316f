use sdlc_contracts::{Entity, split_entity_path};
use serde_json::Value;

/// Sentinel produced in place of an entity whose file failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEntity {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityRead {
    Valid(Entity),
    Invalid(InvalidEntity),
}

impl EntityRead {
    pub fn is_valid(&self) -> bool {
        matches!(self, EntityRead::Valid(_))
    }
}

pub fn decode_entity_file(entity_path: &str, bytes: &[u8]) -> EntityRead {
    match decode(entity_path, bytes) {
        Ok(entity) => EntityRead::Valid(entity),
        Err(reason) => EntityRead::Invalid(InvalidEntity {
            path: entity_path.to_string(),
            reason,
        }),
    }
}

fn decode(entity_path: &str, bytes: &[u8]) -> Result<Entity, String> {
    let value = serde_json::from_slice::<Value>(bytes)
        .map_err(|err| format!("entity file is not valid JSON: {}", err))?;

    let Value::Object(mut obj) = value else {
        return Err("entity file must contain a JSON object".to_string());
    };

    let classifier_path = obj
        .get("classifierPath")
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| "missing or empty classifierPath".to_string())?;

    if let Some(declared) = obj.get("path") {
        match declared.as_str() {
            Some(declared) if declared == entity_path => {}
            Some(declared) => {
                return Err(format!(
                    "declared path \"{}\" does not match file location",
                    declared
                ));
            }
            None => return Err("path must be a string".to_string()),
        }
    }

    let content = match obj.remove("content") {
        Some(Value::Object(content)) => content,
        Some(_) => return Err("content must be a JSON object".to_string()),
        None => return Err("missing content".to_string()),
    };

    let (package, name) = split_entity_path(entity_path);
    if let Some(declared) = content.get("package")
        && declared.as_str() != Some(package)
    {
        return Err(format!(
            "content package {} does not match file location (expected \"{}\")",
            declared, package
        ));
    }
    if let Some(declared) = content.get("name")
        && declared.as_str() != Some(name)
    {
        return Err(format!(
            "content name {} does not match file location (expected \"{}\")",
            declared, name
        ));
    }

    Ok(Entity {
        path: entity_path.to_string(),
        classifier_path,
        content,
    })
}
