//! EC2 Query API client for Elastic IP association

use crate::binder::sigv4::RequestSigner;
use crate::binder::{AddressProvider, AddressRecord};
use crate::common::{Error, Result};
use crate::identity::Credentials;
use async_trait::async_trait;
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

const API_VERSION: &str = "2016-11-15";
const SERVICE: &str = "ec2";
const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// RFC 3986 unreserved characters stay as-is
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Deserialize)]
struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    items: Vec<T>,
}

impl<T> Default for ItemSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
struct DescribeAddressesResponse {
    #[serde(rename = "addressesSet", default)]
    addresses: ItemSet<AddressItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressItem {
    allocation_id: Option<String>,
    public_ip: Option<String>,
    instance_id: Option<String>,
    association_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssociateAddressResponse {
    association_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Errors")]
    errors: ErrorList,
}

#[derive(Debug, Deserialize)]
struct ErrorList {
    #[serde(rename = "Error", default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn encode_form(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, QUERY_ENCODE_SET),
                utf8_percent_encode(v, QUERY_ENCODE_SET)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_error(action: &str, status: reqwest::StatusCode, body: &str) -> Error {
    match quick_xml::de::from_str::<ErrorResponse>(body) {
        Ok(resp) => match resp.errors.errors.into_iter().next() {
            Some(err) => Error::Ec2 {
                action: action.to_string(),
                code: err.code,
                message: err.message,
            },
            None => Error::Ec2 {
                action: action.to_string(),
                code: status.to_string(),
                message: "empty error list".to_string(),
            },
        },
        Err(_) => Error::Ec2 {
            action: action.to_string(),
            code: status.to_string(),
            message: body.trim().to_string(),
        },
    }
}

/// Signed client for one EC2 regional endpoint
pub struct Ec2Client {
    client: reqwest::Client,
    endpoint: Url,
    host: String,
    region: String,
    credentials: Credentials,
}

impl Ec2Client {
    pub fn new(endpoint: &str, region: &str, credentials: Credentials) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::InvalidConfig(format!("invalid EC2 endpoint {}: {}", endpoint, e)))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(Error::InvalidConfig(format!(
                    "EC2 endpoint {} has no host",
                    endpoint
                )))
            }
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            host,
            region: region.to_string(),
            credentials,
        })
    }

    /// POST one Query API action and return the XML body
    async fn call(&self, action: &str, params: &[(&str, &str)]) -> Result<String> {
        let mut form = vec![("Action", action)];
        form.extend_from_slice(params);
        form.push(("Version", API_VERSION));
        let body = encode_form(&form);

        let path = self.endpoint.path().to_string();
        let signed = RequestSigner::new(&self.credentials, &self.region, SERVICE).sign(
            "POST",
            &self.host,
            &path,
            &[("content-type", CONTENT_TYPE)],
            body.as_bytes(),
            Utc::now(),
        );

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization);
        if let Some(token) = &signed.security_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(parse_error(action, status, &text));
        }
        tracing::debug!("{} succeeded", action);
        Ok(text)
    }
}

#[async_trait]
impl AddressProvider for Ec2Client {
    async fn describe_address(&self, allocation_id: &str) -> Result<AddressRecord> {
        let body = match self
            .call("DescribeAddresses", &[("AllocationId.1", allocation_id)])
            .await
        {
            Ok(body) => body,
            Err(Error::Ec2 { code, .. }) if code == "InvalidAllocationID.NotFound" => {
                return Err(Error::AddressNotFound(allocation_id.to_string()))
            }
            Err(e) => return Err(e),
        };

        let response: DescribeAddressesResponse = quick_xml::de::from_str(&body)?;
        let item = response
            .addresses
            .items
            .into_iter()
            .next()
            .ok_or_else(|| Error::AddressNotFound(allocation_id.to_string()))?;

        Ok(AddressRecord {
            allocation_id: non_empty(item.allocation_id).unwrap_or_else(|| allocation_id.to_string()),
            public_ip: non_empty(item.public_ip),
            instance_id: non_empty(item.instance_id),
            association_id: non_empty(item.association_id),
        })
    }

    async fn associate_address(&self, allocation_id: &str, instance_id: &str) -> Result<String> {
        let body = self
            .call(
                "AssociateAddress",
                &[
                    ("AllocationId", allocation_id),
                    ("AllowReassociation", "true"),
                    ("InstanceId", instance_id),
                ],
            )
            .await?;

        let response: AssociateAddressResponse = quick_xml::de::from_str(&body)?;
        non_empty(response.association_id)
            .ok_or_else(|| Error::Decode("AssociateAddress returned no associationId".into()))
    }

    async fn disassociate_address(&self, association_id: &str) -> Result<()> {
        self.call("DisassociateAddress", &[("AssociationId", association_id)])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> Credentials {
        Credentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "secret".into(),
            session_token: Some("token".into()),
        }
    }

    fn client_for(server: &MockServer) -> Ec2Client {
        Ec2Client::new(&server.uri(), "us-east-1", credentials()).unwrap()
    }

    const DESCRIBE_ASSOCIATED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeAddressesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>f7de5e98-491a-4c19-a92d-908d6EXAMPLE</requestId>
    <addressesSet>
        <item>
            <publicIp>203.0.113.41</publicIp>
            <allocationId>eipalloc-08229861</allocationId>
            <domain>vpc</domain>
            <instanceId>i-0598c7d356eba48d7</instanceId>
            <associationId>eipassoc-f0229899</associationId>
            <networkInterfaceId>eni-ef229886</networkInterfaceId>
            <networkInterfaceOwnerId>053230519467</networkInterfaceOwnerId>
            <privateIpAddress>10.0.0.228</privateIpAddress>
        </item>
    </addressesSet>
</DescribeAddressesResponse>"#;

    const DESCRIBE_UNASSOCIATED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeAddressesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>f7de5e98-491a-4c19-a92d-908d6EXAMPLE</requestId>
    <addressesSet>
        <item>
            <publicIp>203.0.113.41</publicIp>
            <allocationId>eipalloc-08229861</allocationId>
            <domain>vpc</domain>
        </item>
    </addressesSet>
</DescribeAddressesResponse>"#;

    const NOT_FOUND: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Response><Errors><Error><Code>InvalidAllocationID.NotFound</Code><Message>The allocation ID 'eipalloc-missing' does not exist</Message></Error></Errors><RequestID>ea966190-f9aa-478e-9ede-example</RequestID></Response>"#;

    #[tokio::test]
    async fn test_describe_associated() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_string_contains("Action=DescribeAddresses"))
            .and(body_string_contains("AllocationId.1=eipalloc-08229861"))
            .and(body_string_contains("Version=2016-11-15"))
            .and(header_exists("authorization"))
            .and(header_exists("x-amz-security-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DESCRIBE_ASSOCIATED))
            .mount(&server)
            .await;

        let record = client_for(&server)
            .describe_address("eipalloc-08229861")
            .await
            .unwrap();
        assert_eq!(record.allocation_id, "eipalloc-08229861");
        assert_eq!(record.public_ip.as_deref(), Some("203.0.113.41"));
        assert_eq!(record.instance_id.as_deref(), Some("i-0598c7d356eba48d7"));
        assert_eq!(record.association(), Some("eipassoc-f0229899"));
    }

    #[tokio::test]
    async fn test_describe_unassociated() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DESCRIBE_UNASSOCIATED))
            .mount(&server)
            .await;

        let record = client_for(&server)
            .describe_address("eipalloc-08229861")
            .await
            .unwrap();
        assert_eq!(record.association(), None);
        assert_eq!(record.instance_id, None);
    }

    #[tokio::test]
    async fn test_describe_unknown_allocation_is_fatal() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string(NOT_FOUND))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .describe_address("eipalloc-missing")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AddressNotFound(ref id) if id == "eipalloc-missing"));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_describe_empty_set_is_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<DescribeAddressesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/"><requestId>r-1</requestId><addressesSet/></DescribeAddressesResponse>"#,
            ))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .describe_address("eipalloc-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AddressNotFound(_)));
    }

    #[tokio::test]
    async fn test_associate_allows_reassociation() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_string_contains("Action=AssociateAddress"))
            .and(body_string_contains("AllocationId=eipalloc-1"))
            .and(body_string_contains("InstanceId=i-self"))
            .and(body_string_contains("AllowReassociation=true"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<AssociateAddressResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>r-2</requestId>
    <return>true</return>
    <associationId>eipassoc-new</associationId>
</AssociateAddressResponse>"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let association = client_for(&server)
            .associate_address("eipalloc-1", "i-self")
            .await
            .unwrap();
        assert_eq!(association, "eipassoc-new");
    }

    #[tokio::test]
    async fn test_disassociate_uses_association_id() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_string_contains("Action=DisassociateAddress"))
            .and(body_string_contains("AssociationId=eipassoc-old"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<DisassociateAddressResponse><requestId>r-3</requestId><return>true</return></DisassociateAddressResponse>"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .disassociate_address("eipassoc-old")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_api_error_carries_code() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                r#"<Response><Errors><Error><Code>UnauthorizedOperation</Code><Message>You are not authorized to perform this operation.</Message></Error></Errors><RequestID>r-4</RequestID></Response>"#,
            ))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .associate_address("eipalloc-1", "i-self")
            .await
            .unwrap_err();
        match err {
            Error::Ec2 { action, code, .. } => {
                assert_eq!(action, "AssociateAddress");
                assert_eq!(code, "UnauthorizedOperation");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_encode_form() {
        assert_eq!(
            encode_form(&[("Action", "DescribeAddresses"), ("AllocationId.1", "eipalloc-1 x")]),
            "Action=DescribeAddresses&AllocationId.1=eipalloc-1%20x"
        );
    }

    #[test]
    fn test_endpoint_host_includes_port() {
        let client = Ec2Client::new("http://localhost:4566", "us-east-1", credentials()).unwrap();
        assert_eq!(client.host, "localhost:4566");

        let client =
            Ec2Client::new("https://ec2.us-east-1.amazonaws.com", "us-east-1", credentials())
                .unwrap();
        assert_eq!(client.host, "ec2.us-east-1.amazonaws.com");
        assert!(Ec2Client::new("not a url", "us-east-1", credentials()).is_err());
    }
}
