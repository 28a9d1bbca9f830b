//! Image resolution for new Scaleway instances.
//!
//! Project-scoped images win over public ones; within the winning source the
//! newest available image for the requested architecture is chosen.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};

use super::{ScalewayProvider, ScalewayProviderError};

/// What to look up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct ImageQuery {
    pub(super) label: String,
    pub(super) arch: String,
    pub(super) zone: String,
    pub(super) project: String,
    pub(super) organization: Option<String>,
}

impl ScalewayProvider {
    pub(super) async fn resolve_image_id(
        &self,
        query: &ImageQuery,
    ) -> Result<String, ScalewayProviderError> {
        Self::resolve_image_id_with(
            query,
            || async move {
                let mut scoped = ScalewayListInstanceImagesBuilder::new(self.api.clone(), &query.zone)
                    .public(true)
                    .project(&query.project)
                    .name(&query.label)
                    .arch(&query.arch);
                if let Some(ref org) = query.organization {
                    scoped = scoped.organization(org);
                }
                scoped.run_async().await.map_err(ScalewayProviderError::from)
            },
            || async move {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), &query.zone)
                    .public(true)
                    .name(&query.label)
                    .arch(&query.arch)
                    .run_async()
                    .await
                    .map_err(ScalewayProviderError::from)
            },
        )
        .await
    }

    pub(super) async fn resolve_image_id_with<FutA, FutB, FetchA, FetchB>(
        query: &ImageQuery,
        project_fetch: FetchA,
        public_fetch: FetchB,
    ) -> Result<String, ScalewayProviderError>
    where
        FetchA: FnOnce() -> FutA,
        FetchB: FnOnce() -> FutB,
        FutA: Future<Output = Result<Vec<ScalewayImage>, ScalewayProviderError>>,
        FutB: Future<Output = Result<Vec<ScalewayImage>, ScalewayProviderError>>,
    {
        let project_images = project_fetch().await?;
        let candidates = if project_images.is_empty() {
            public_fetch().await?
        } else {
            project_images
        };
        Self::select_image_id(candidates, query)
    }

    pub(super) fn select_image_id(
        candidates: Vec<ScalewayImage>,
        query: &ImageQuery,
    ) -> Result<String, ScalewayProviderError> {
        candidates
            .into_iter()
            .filter(|image| image.arch == query.arch && image.state == "available")
            .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
            .map(|image| image.id)
            .ok_or_else(|| ScalewayProviderError::ImageNotFound {
                label: query.label.clone(),
                arch: query.arch.clone(),
                zone: query.zone.clone(),
            })
    }
}
