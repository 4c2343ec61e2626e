//! REST client for the marketplace control plane.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::{
    ControlPlane, ControlPlaneError, ControlPlaneFuture, CreateInstanceRequest, Endpoint,
    Instance, InstanceId, InstanceState, TargetState,
};

/// Default control plane base URL.
pub const DEFAULT_SERVER_URL: &str = "https://console.vast.ai";

const API_PREFIX: &str = "/api/v0";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const UNAUTHORISED_DETAIL: &str = "please log in or sign up";
const MISSING_DETAIL: &str = "(no detail message supplied)";

/// [`ControlPlane`] implementation backed by the marketplace REST API.
#[derive(Clone, Debug)]
pub struct VastClient {
    http: reqwest::Client,
    server_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    instances: Vec<InstanceRecord>,
}

#[derive(Debug, Deserialize)]
struct InstanceRecord {
    id: u64,
    actual_status: Option<String>,
    ssh_host: Option<String>,
    ssh_port: Option<u16>,
    label: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Ack {
    success: Option<bool>,
    msg: Option<String>,
    new_contract: Option<u64>,
}

impl VastClient {
    /// Creates a client for `server_url`, authenticating with `api_key` when
    /// one is available.
    #[must_use]
    pub fn new(server_url: impl Into<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            server_url: server_url.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    fn url(&self, subpath: &str) -> String {
        format!(
            "{}{API_PREFIX}{subpath}",
            self.server_url.trim_end_matches('/')
        )
    }

    fn authenticated(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.query(&[("api_key", key.as_str())]),
            None => builder,
        }
    }

    async fn instance_snapshot(&self, id: InstanceId) -> Result<Instance, ControlPlaneError> {
        let cache_buster = Uuid::new_v4().simple().to_string();
        let request = self
            .http
            .get(self.url("/instances"))
            .query(&[("owner", "me"), (".r", cache_buster.as_str())]);
        let response = checked(self.authenticated(request).send().await?).await?;
        let body = response.text().await?;
        find_instance(&body, id)
    }

    async fn put_state(&self, id: InstanceId, state: TargetState) -> Result<(), ControlPlaneError> {
        debug!(instance = %id, %state, "requesting instance state change");
        let request = self
            .http
            .put(self.url(&format!("/instances/{id}/")))
            .json(&json!({ "state": state }));
        let response = checked(self.authenticated(request).send().await?).await?;
        parse_ack(&response.text().await?).map(|_| ())
    }

    async fn delete_instance(&self, id: InstanceId) -> Result<(), ControlPlaneError> {
        debug!(instance = %id, "requesting instance destruction");
        let request = self
            .http
            .delete(self.url(&format!("/instances/{id}/")))
            .json(&json!({}));
        let response = checked(self.authenticated(request).send().await?).await?;
        parse_ack(&response.text().await?).map(|_| ())
    }

    async fn rent(&self, request: &CreateInstanceRequest) -> Result<InstanceId, ControlPlaneError> {
        debug!(offer = request.offer_id, image = %request.image, "renting instance");
        let body = json!({
            "client_id": "me",
            "image": request.image,
            "disk": request.disk_gb,
            "price": request.price,
            "label": request.label,
            "onstart": request.onstart,
            "runtype": "ssh",
            "env": {},
        });
        let builder = self
            .http
            .put(self.url(&format!("/asks/{}/", request.offer_id)))
            .json(&body);
        let response = checked(self.authenticated(builder).send().await?).await?;
        let ack = parse_ack(&response.text().await?)?;
        ack.new_contract
            .map(InstanceId::new)
            .ok_or_else(|| ControlPlaneError::Decode {
                message: String::from("response is missing new_contract"),
            })
    }
}

impl ControlPlane for VastClient {
    type Error = ControlPlaneError;

    fn instance(&self, id: InstanceId) -> ControlPlaneFuture<'_, Instance, Self::Error> {
        Box::pin(async move { self.instance_snapshot(id).await })
    }

    fn set_state(
        &self,
        id: InstanceId,
        state: TargetState,
    ) -> ControlPlaneFuture<'_, (), Self::Error> {
        Box::pin(async move { self.put_state(id, state).await })
    }

    fn destroy(&self, id: InstanceId) -> ControlPlaneFuture<'_, (), Self::Error> {
        Box::pin(async move { self.delete_instance(id).await })
    }

    fn create<'a>(
        &'a self,
        request: &'a CreateInstanceRequest,
    ) -> ControlPlaneFuture<'a, InstanceId, Self::Error> {
        Box::pin(async move { self.rent(request).await })
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ControlPlaneError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ControlPlaneError::Http {
        status: status.as_u16(),
        message: error_detail(status.as_u16(), &body),
    })
}

fn error_detail(status: u16, body: &str) -> String {
    serde_json::from_str::<Ack>(body)
        .ok()
        .and_then(|ack| ack.msg)
        .unwrap_or_else(|| {
            if status == 401 {
                String::from(UNAUTHORISED_DETAIL)
            } else {
                String::from(MISSING_DETAIL)
            }
        })
}

fn parse_ack(body: &str) -> Result<Ack, ControlPlaneError> {
    if body.trim().is_empty() {
        return Ok(Ack::default());
    }

    let ack: Ack = serde_json::from_str(body).map_err(|err| ControlPlaneError::Decode {
        message: err.to_string(),
    })?;
    if ack.success == Some(false) {
        return Err(ControlPlaneError::Rejected {
            message: ack.msg.unwrap_or_else(|| String::from(MISSING_DETAIL)),
        });
    }
    Ok(ack)
}

fn find_instance(body: &str, id: InstanceId) -> Result<Instance, ControlPlaneError> {
    let list: InstanceList = serde_json::from_str(body).map_err(|err| ControlPlaneError::Decode {
        message: err.to_string(),
    })?;

    let record = list
        .instances
        .into_iter()
        .find(|record| record.id == id.get())
        .ok_or(ControlPlaneError::NotFound { id })?;

    let endpoint = match (record.ssh_host, record.ssh_port) {
        (Some(host), Some(port)) if !host.trim().is_empty() => Some(Endpoint::new(host, port)),
        _ => None,
    };

    Ok(Instance {
        id,
        state: InstanceState::from_status(record.actual_status.as_deref()),
        endpoint,
        label: record.label,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const LISTING: &str = r#"{
        "instances": [
            {"id": 7, "actual_status": "loading", "ssh_host": null, "ssh_port": null},
            {"id": 42, "actual_status": "running", "ssh_host": "ssh5.vast.ai",
             "ssh_port": 31042, "label": "trainer", "gpu_name": "RTX 4090"}
        ]
    }"#;

    #[test]
    fn find_instance_maps_running_record() {
        let instance = find_instance(LISTING, InstanceId::new(42))
            .unwrap_or_else(|err| panic!("instance should be found: {err}"));

        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.endpoint, Some(Endpoint::new("ssh5.vast.ai", 31_042)));
        assert_eq!(instance.label.as_deref(), Some("trainer"));
    }

    #[test]
    fn find_instance_leaves_endpoint_empty_until_assigned() {
        let instance = find_instance(LISTING, InstanceId::new(7))
            .unwrap_or_else(|err| panic!("instance should be found: {err}"));

        assert_eq!(instance.state, InstanceState::Provisioning);
        assert!(instance.endpoint.is_none());
    }

    #[test]
    fn find_instance_reports_unknown_ids() {
        let err = find_instance(LISTING, InstanceId::new(9)).expect_err("id 9 is not listed");
        assert_eq!(
            err,
            ControlPlaneError::NotFound {
                id: InstanceId::new(9)
            }
        );
    }

    #[test]
    fn find_instance_rejects_malformed_bodies() {
        let err = find_instance("{\"oops\": []}", InstanceId::new(1))
            .expect_err("missing instances key should fail");
        assert!(matches!(err, ControlPlaneError::Decode { .. }), "got {err:?}");
    }

    #[rstest]
    #[case(401, "", UNAUTHORISED_DETAIL)]
    #[case(500, "<html>", MISSING_DETAIL)]
    #[case(400, r#"{"success": false, "msg": "invalid offer"}"#, "invalid offer")]
    fn error_detail_prefers_msg_field(
        #[case] status: u16,
        #[case] body: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(error_detail(status, body), expected);
    }

    #[test]
    fn parse_ack_surfaces_rejections() {
        let err = parse_ack(r#"{"success": false, "msg": "no such instance"}"#)
            .expect_err("success=false should be rejected");
        assert_eq!(
            err,
            ControlPlaneError::Rejected {
                message: String::from("no such instance")
            }
        );
    }

    #[test]
    fn parse_ack_reads_new_contract() {
        let ack = parse_ack(r#"{"success": true, "new_contract": 9001}"#)
            .unwrap_or_else(|err| panic!("ack should parse: {err}"));
        assert_eq!(ack.new_contract, Some(9001));
    }

    #[test]
    fn url_joins_api_prefix_without_double_slash() {
        let client = VastClient::new("https://console.example/", None);
        assert_eq!(
            client.url("/instances/3/"),
            "https://console.example/api/v0/instances/3/"
        );
    }
}
