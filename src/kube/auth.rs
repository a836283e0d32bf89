//! Pod-bound bearer authentication for the controller API.
//!
//! Caller tokens are submitted to the cluster's token review with the
//! `manager` audience; the pod identity is extracted from the review
//! and cross-checked (by UID) against the watched pod cache. Negative
//! reviews are never cached.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::{header, HeaderMap};
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use k8s_openapi::api::core::v1::Pod;
use kube::api::PostParams;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client};
use tracing::warn;

use crate::errors::AppError;

pub(crate) const AUDIENCE: &str = "manager";

const POD_NAME_KEY: &str = "authentication.kubernetes.io/pod-name";
const POD_UID_KEY: &str = "authentication.kubernetes.io/pod-uid";
const SERVICE_ACCOUNT_GROUP_PREFIX: &str = "system:serviceaccounts:";

fn unauthorized(message: &str) -> AppError {
    AppError::Unauthorized(message.into())
}

pub(crate) async fn authenticate_pod(
    client: &Client,
    pods: &Store<Pod>,
    headers: &HeaderMap,
) -> Result<Arc<Pod>, AppError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let token = match authorization.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token,
        _ => return Err(unauthorized("invalid token")),
    };

    let review = TokenReview {
        spec: TokenReviewSpec {
            token: Some(token.to_string()),
            audiences: Some(vec![AUDIENCE.to_string()]),
        },
        ..Default::default()
    };
    let review = Api::<TokenReview>::all(client.clone())
        .create(&PostParams::default(), &review)
        .await
        .map_err(|err| {
            warn!(error = %err, "failed to validate token");
            unauthorized("invalid token")
        })?;

    let status = review.status.ok_or_else(|| unauthorized("invalid token"))?;
    if let Some(error) = status.error.filter(|error| !error.is_empty()) {
        return Err(unauthorized(&error));
    }
    if !status.authenticated.unwrap_or(false) {
        return Err(unauthorized("unauthenticated"));
    }

    let user = status.user.ok_or_else(|| unauthorized("invalid token"))?;
    let extra = user.extra.unwrap_or_default();
    let pod_name = extra_value(&extra, POD_NAME_KEY).ok_or_else(|| unauthorized("invalid token"))?;
    let pod_uid = extra_value(&extra, POD_UID_KEY).ok_or_else(|| unauthorized("invalid token"))?;

    let namespace = user
        .groups
        .unwrap_or_default()
        .iter()
        .find_map(|group| group.strip_prefix(SERVICE_ACCOUNT_GROUP_PREFIX).map(str::to_string))
        .filter(|namespace| !namespace.is_empty())
        .ok_or_else(|| unauthorized("invalid token"))?;

    let pod = pods
        .get(&ObjectRef::new(&pod_name).within(&namespace))
        .ok_or_else(|| unauthorized("invalid token"))?;
    if pod.metadata.uid.as_deref() != Some(pod_uid.as_str()) {
        return Err(unauthorized("invalid token"));
    }

    Ok(pod)
}

fn extra_value(extra: &BTreeMap<String, Vec<String>>, key: &str) -> Option<String> {
    let values = extra.get(key)?;
    match values.as_slice() {
        [value] => Some(value.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_value_requires_exactly_one_entry() {
        let mut extra = BTreeMap::new();
        extra.insert("k".to_string(), vec!["v".to_string()]);
        assert_eq!(extra_value(&extra, "k"), Some("v".to_string()));

        extra.insert("multi".to_string(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(extra_value(&extra, "multi"), None);
        assert_eq!(extra_value(&extra, "absent"), None);
    }
}
