pub mod decode;
pub mod filter;
pub mod paths;

pub use decode::{EntityRead, InvalidEntity, decode_entity_file};
pub use filter::{
    EntityFilter, EntityFilterParams, ProfileRef, TaggedValueRegex, invalid_entities_error,
};
pub use paths::{entity_path_for_file, file_path_for_entity, validate_entity_path};
