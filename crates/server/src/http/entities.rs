use axum::extract::{Path, RawQuery, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use sdlc_contracts::{Entity, SdlcError};
use sdlc_entities::{EntityFilter, EntityFilterParams};

use super::{
    ApiError, AppState, PathParams, TargetKind, describe_target, execute_with_logging,
    parse_query, query_bool, query_value, query_values, target_from_path,
};
use crate::context::ContextResolver;
use crate::store::EntityStore;

pub(super) fn routes(
    router: Router<AppState>,
    base: &str,
    kind: TargetKind,
) -> Router<AppState> {
    router
        .route(
            &format!("{}/entities", base),
            get(
                move |State(state): State<AppState>,
                      Path(params): Path<PathParams>,
                      headers: HeaderMap,
                      RawQuery(query): RawQuery| async move {
                    list_entities(state, kind, params, headers, query).await
                },
            ),
        )
        .route(
            &format!("{}/entities/{{entity_path}}", base),
            get(
                move |State(state): State<AppState>,
                      Path(params): Path<PathParams>,
                      headers: HeaderMap,
                      RawQuery(query): RawQuery| async move {
                    get_entity(state, kind, params, headers, query).await
                },
            ),
        )
}

async fn list_entities(
    state: AppState,
    kind: TargetKind,
    params: PathParams,
    headers: HeaderMap,
    query: Option<String>,
) -> Result<Json<Vec<Entity>>, ApiError> {
    let config = &state.config;
    let target = target_from_path(kind, &params);
    let description = format!("getting entities in {}", describe_target(&target));

    let entities = execute_with_logging(
        &state,
        &headers,
        "list_entities",
        "GET",
        description,
        |api| async move {
            let (project_id, target) = target?;
            let filter = EntityFilter::compile(&filter_params(query.as_deref())?)?;

            let resolver = ContextResolver::new(&api, config.project_id_prefix.as_deref());
            let context = resolver.resolve(&project_id, &target).await?;

            let store =
                EntityStore::new(&api, &config.entities_root, config.entity_fetch_concurrency);
            let reads = store.list(&context).await?;
            filter.apply(reads)
        },
    )
    .await?;

    Ok(Json(entities))
}

async fn get_entity(
    state: AppState,
    kind: TargetKind,
    params: PathParams,
    headers: HeaderMap,
    query: Option<String>,
) -> Result<Json<Option<Entity>>, ApiError> {
    let config = &state.config;
    let target = target_from_path(kind, &params);
    let entity_path = params.get("entity_path").cloned().unwrap_or_default();
    let description = format!(
        "getting entity {} in {}",
        entity_path,
        describe_target(&target)
    );

    let entity = execute_with_logging(
        &state,
        &headers,
        "get_entity",
        "GET",
        description,
        |api| async move {
            let (project_id, target) = target?;
            if entity_path.is_empty() {
                return Err(SdlcError::bad_request("entity path may not be empty"));
            }
            let pairs = parse_query(query.as_deref());
            let exclude_invalid = query_bool(&pairs, "excludeInvalid", false)?;

            let resolver = ContextResolver::new(&api, config.project_id_prefix.as_deref());
            let context = resolver.resolve(&project_id, &target).await?;

            let store =
                EntityStore::new(&api, &config.entities_root, config.entity_fetch_concurrency);
            store.get(&context, &entity_path, exclude_invalid).await
        },
    )
    .await?;

    Ok(Json(entity))
}

fn filter_params(query: Option<&str>) -> Result<EntityFilterParams, SdlcError> {
    let pairs = parse_query(query);

    Ok(EntityFilterParams {
        classifier_paths: query_values(&pairs, "classifierPath"),
        packages: query_values(&pairs, "package"),
        include_sub_packages: query_bool(&pairs, "includeSubPackages", true)?,
        name_regex: query_value(&pairs, "name")
            .filter(|raw| !raw.is_empty())
            .map(str::to_string),
        stereotypes: query_values(&pairs, "stereotype"),
        tagged_value_regexes: query_values(&pairs, "taggedValue"),
        exclude_invalid: query_bool(&pairs, "excludeInvalid", false)?,
    })
}
