use crate::backup::BackupError;
use crate::workload::{Workload, WorkloadMutator};
use axum::http::StatusCode;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("expected a {expected} but the request is for a {actual}")]
    KindMismatch {
        expected: &'static str,
        actual: String,
    },

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("failed to serialize mutated {kind}: {source}")]
    Serialization {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl AdmissionError {
    /// Only a malformed or misrouted object is the caller's fault; every other failure is
    /// reported as a server error so the workload is denied.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::Decode { .. } | AdmissionError::KindMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            AdmissionError::Backup(_) | AdmissionError::Serialization { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Turns admission requests for a workload kind into JSON patch responses.
pub struct AdmissionHandler {
    mutator: WorkloadMutator,
}

impl AdmissionHandler {
    pub fn new(mutator: WorkloadMutator) -> Self {
        Self { mutator }
    }

    /// Decodes a raw admission review body and answers it with a review.
    pub async fn review<K: Workload>(&self, body: &[u8]) -> AdmissionReview<DynamicObject> {
        let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(body) {
            Ok(review) => review,
            Err(e) => {
                error!("Failed to parse admission review for {}: {}", K::kind_name(), e);
                return invalid(e.to_string()).into_review();
            }
        };

        let request: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(request) => request,
            Err(e) => {
                error!("Admission review for {} has no request: {}", K::kind_name(), e);
                return invalid(e.to_string()).into_review();
            }
        };

        self.handle::<K>(&request).await.into_review()
    }

    pub async fn handle<K: Workload>(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> AdmissionResponse {
        let uid = &request.uid;

        if request.kind.kind != K::kind_name() {
            let e = AdmissionError::KindMismatch {
                expected: K::kind_name(),
                actual: request.kind.kind.clone(),
            };
            error!("Rejecting admission request {}: {}", uid, e);
            return errored(AdmissionResponse::from(request), e.status_code(), e);
        }

        let Some(object) = &request.object else {
            debug!(
                "No object in {:?} request {}, allowing unchanged",
                request.operation, uid
            );
            return AdmissionResponse::from(request);
        };

        let patch = match self.patch_for::<K>(object).await {
            Ok(patch) => patch,
            Err(e) => {
                error!("Denying {} admission request {}: {}", K::kind_name(), uid, e);
                return errored(AdmissionResponse::from(request), e.status_code(), e);
            }
        };

        if patch.0.is_empty() {
            info!(
                "All images of {} in request {} are in the backup registry, nothing to patch",
                K::kind_name(),
                uid
            );
            return AdmissionResponse::from(request);
        }

        info!(
            "Patching {} in request {} with {} operations",
            K::kind_name(),
            uid,
            patch.0.len()
        );
        match AdmissionResponse::from(request).with_patch(patch) {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to serialize patch for request {}: {}", uid, e);
                errored(
                    AdmissionResponse::from(request),
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("patch serialization error: {e}"),
                )
            }
        }
    }

    /// JSON patch from the decoded workload to its mutated form.
    ///
    /// Both sides go through the typed representation, so fields the typed
    /// round trip normalizes (e.g. `creationTimestamp: null`) never show up
    /// as patch operations. The resulting paths only touch container images,
    /// which exist unchanged in the object as received.
    async fn patch_for<K: Workload>(
        &self,
        object: &DynamicObject,
    ) -> Result<json_patch::Patch, AdmissionError> {
        let kind = K::kind_name();
        let decode = |source: serde_json::Error| AdmissionError::Decode { kind, source };

        let raw = serde_json::to_value(object).map_err(decode)?;
        let workload: K = serde_json::from_value(raw).map_err(decode)?;
        let original = serde_json::to_value(&workload)
            .map_err(|source| AdmissionError::Serialization { kind, source })?;

        let mutated = self.mutator.mutate(workload).await?;
        let mutated = serde_json::to_value(&mutated)
            .map_err(|source| AdmissionError::Serialization { kind, source })?;

        Ok(json_patch::diff(&original, &mutated))
    }
}

fn invalid(reason: String) -> AdmissionResponse {
    errored(AdmissionResponse::invalid(&reason), StatusCode::BAD_REQUEST, reason)
}

fn errored(
    response: AdmissionResponse,
    code: StatusCode,
    message: impl ToString,
) -> AdmissionResponse {
    let mut response = response.deny(message);
    response.result.code = code.as_u16();
    response
}
