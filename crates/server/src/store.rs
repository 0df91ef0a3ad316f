use futures::{StreamExt, TryStreamExt};
use sdlc_contracts::{Entity, SdlcError};
use sdlc_entities::{
    EntityRead, decode_entity_file, entity_path_for_file, file_path_for_entity,
    invalid_entities_error,
};
use sdlc_gitlab::GitLabApi;

use crate::backend::backend_error;
use crate::context::AccessContext;

pub struct EntityStore<'a> {
    api: &'a GitLabApi,
    root: &'a str,
    concurrency: usize,
}

impl<'a> EntityStore<'a> {
    pub fn new(api: &'a GitLabApi, root: &'a str, concurrency: usize) -> Self {
        Self {
            api,
            root,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn list(&self, context: &AccessContext) -> Result<Vec<EntityRead>, SdlcError> {
        let files = self.entity_files(context).await?;

        let reads = futures::stream::iter(files)
            .map(|(entity_path, file_path)| self.read(context, entity_path, file_path))
            .buffered(self.concurrency)
            .try_collect::<Vec<_>>()
            .await?;

        let invalid = reads.iter().filter(|read| !read.is_valid()).count();
        if invalid > 0 {
            crate::metrics::inc_invalid_entities(invalid);
            tracing::debug!(
                context = %context.describe(),
                invalid,
                "entity listing contains invalid entities"
            );
        }

        Ok(reads)
    }

    pub async fn get(
        &self,
        context: &AccessContext,
        entity_path: &str,
        exclude_invalid: bool,
    ) -> Result<Option<Entity>, SdlcError> {
        let file_path = file_path_for_entity(self.root, entity_path)?;

        match self.read(context, entity_path.to_string(), file_path).await? {
            EntityRead::Valid(entity) => Ok(Some(entity)),
            EntityRead::Invalid(_) if exclude_invalid => {
                crate::metrics::inc_invalid_entities(1);
                Ok(None)
            }
            EntityRead::Invalid(marker) => {
                crate::metrics::inc_invalid_entities(1);
                Err(invalid_entities_error(&[marker]))
            }
        }
    }

    async fn entity_files(
        &self,
        context: &AccessContext,
    ) -> Result<Vec<(String, String)>, SdlcError> {
        let tree = match self
            .api
            .tree(context.gitlab_project_id, self.root, &context.commit)
            .await
        {
            Ok(tree) => tree,
            // No entity directory at this commit means no entities.
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(backend_error(err, &context.describe())),
        };

        let mut files = tree
            .into_iter()
            .filter(|entry| entry.is_blob())
            .filter_map(|entry| {
                entity_path_for_file(self.root, &entry.path).map(|path| (path, entry.path))
            })
            .collect::<Vec<_>>();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        files.dedup_by(|a, b| a.0 == b.0);

        Ok(files)
    }

    async fn read(
        &self,
        context: &AccessContext,
        entity_path: String,
        file_path: String,
    ) -> Result<EntityRead, SdlcError> {
        let bytes = self
            .api
            .raw_file(context.gitlab_project_id, &file_path, &context.commit)
            .await
            .map_err(|err| {
                backend_error(
                    err,
                    &format!("entity {} in {}", entity_path, context.describe()),
                )
            })?;

        Ok(decode_entity_file(&entity_path, &bytes))
    }
}
