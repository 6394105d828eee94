//! Validating admission webhook for the scan resources. The reconcilers do
//! not assume these rules have run; the webhook just rejects bad specs at
//! the door.

use anyhow::{anyhow, Result};
use clamav_operator_k8s_api::{
    validation, ClusterScan, ClusterScanSpec, NodeScan, NodeScanSpec, ScanPolicy, ScanPolicySpec,
    ScanSchedule, ScanScheduleSpec,
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{
    core::{admission::Operation, DynamicObject},
    Resource,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Clone, Default)]
pub struct Admission {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req)
                }
                Err(error) => {
                    warn!(%error, "invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new() -> Self {
        Self {}
    }

    fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        if is_kind::<NodeScan>(&req) {
            return self.admit_node_scan(req);
        }

        if is_kind::<ClusterScan>(&req) {
            return admit_spec::<ClusterScanSpec>(req, |spec| {
                validation::validate_cluster_scan(spec).map_err(Into::into)
            });
        }

        if is_kind::<ScanPolicy>(&req) {
            return admit_spec::<ScanPolicySpec>(req, |spec| {
                validation::validate_scan_policy(spec).map_err(Into::into)
            });
        }

        if is_kind::<ScanSchedule>(&req) {
            return admit_spec::<ScanScheduleSpec>(req, |spec| {
                validation::validate_scan_schedule(spec).map_err(Into::into)
            });
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    /// NodeScans get the common rules plus nodeName immutability on update.
    fn admit_node_scan(self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);

        let spec = match parse_spec::<NodeScanSpec>(req.object.as_ref()) {
            Ok(spec) => spec,
            Err(error) => {
                info!(%error, "failed to parse NodeScan spec");
                return rsp.deny(error);
            }
        };

        let result = if matches!(req.operation, Operation::Update) {
            match parse_spec::<NodeScanSpec>(req.old_object.as_ref()) {
                Ok(old) => validation::validate_node_scan_update(&old, &spec),
                Err(error) => {
                    info!(%error, "failed to parse prior NodeScan spec");
                    return rsp.deny(error);
                }
            }
        } else {
            validation::validate_node_scan(&spec)
        };

        match result {
            Ok(()) => rsp,
            Err(error) => {
                info!(%error, "denied NodeScan");
                rsp.deny(error.to_string())
            }
        }
    }
}

fn admit_spec<T>(
    req: AdmissionRequest,
    validate: impl Fn(&T) -> Result<()>,
) -> AdmissionResponse
where
    T: DeserializeOwned,
{
    let rsp = AdmissionResponse::from(&req);

    let kind = req.kind.kind.clone();
    let spec = match parse_spec::<T>(req.object.as_ref()) {
        Ok(spec) => spec,
        Err(error) => {
            info!(%error, "failed to parse {} spec", kind);
            return rsp.deny(error);
        }
    };

    if let Err(error) = validate(&spec) {
        info!(%error, %kind, "denied");
        return rsp.deny(error.to_string());
    }

    rsp
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: Review) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn parse_spec<T: DeserializeOwned>(obj: Option<&DynamicObject>) -> Result<T> {
    let obj = obj.ok_or_else(|| anyhow!("admission request missing 'object'"))?;
    let data = obj
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
    Ok(serde_json::from_value(data)?)
}
