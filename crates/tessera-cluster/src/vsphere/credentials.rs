//! vCenter credentials and connection parameters
//!
//! Credentials are read from a fixed secret on the management cluster and
//! carried in a [`VSphereConnection`] value handed to whatever needs to talk
//! to vCenter. Nothing is exported into the operator's process environment;
//! subprocesses get the values on their own command environment.

use std::fmt;

use k8s_openapi::api::core::v1::Secret;

use tessera_common::crd::VSphereDatacenterConfigSpec;
use tessera_common::store::get_typed;
use tessera_common::{Error, ObjectKey, ObjectStore};

/// Name of the secret holding vCenter credentials
pub const CREDENTIALS_SECRET_NAME: &str = "vsphere-credentials";

/// Secret data key for the vCenter user
pub const USERNAME_KEY: &str = "username";

/// Secret data key for the vCenter password
pub const PASSWORD_KEY: &str = "password";

/// vCenter username/password pair
#[derive(Clone, PartialEq, Eq)]
pub struct VSphereCredentials {
    /// vCenter user
    pub username: String,
    /// vCenter password
    pub password: String,
}

impl fmt::Debug for VSphereCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VSphereCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Read credentials from `<namespace>/vsphere-credentials`
pub async fn read_credentials(
    store: &dyn ObjectStore,
    namespace: &str,
) -> Result<VSphereCredentials, Error> {
    let key = ObjectKey::namespaced(namespace, CREDENTIALS_SECRET_NAME);
    let secret: Secret = get_typed(store, &key)
        .await
        .map_err(|e| Error::credentials(format!("reading secret {}: {}", key, e)))?
        .ok_or_else(|| Error::credentials(format!("secret {} not found", key)))?;

    Ok(VSphereCredentials {
        username: secret_string(&secret, &key, USERNAME_KEY)?,
        password: secret_string(&secret, &key, PASSWORD_KEY)?,
    })
}

fn secret_string(secret: &Secret, key: &ObjectKey, field: &str) -> Result<String, Error> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(field))
        .ok_or_else(|| Error::credentials(format!("secret {} missing key {}", key, field)))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|_| Error::credentials(format!("secret {} key {} is not UTF-8", key, field)))
}

/// Everything needed to talk to one vCenter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VSphereConnection {
    /// vCenter hostname or IP
    pub server: String,
    /// Datacenter name or path
    pub datacenter: String,
    /// Skip TLS verification
    pub insecure: bool,
    /// Expected certificate thumbprint, empty when unset
    pub thumbprint: String,
    /// Login credentials
    pub credentials: VSphereCredentials,
}

impl VSphereConnection {
    /// Combine a datacenter spec with credentials
    pub fn new(datacenter: &VSphereDatacenterConfigSpec, credentials: VSphereCredentials) -> Self {
        Self {
            server: datacenter.server.clone(),
            datacenter: datacenter.datacenter.clone(),
            insecure: datacenter.insecure,
            thumbprint: datacenter.thumbprint.clone(),
            credentials,
        }
    }

    /// Environment for a `govc` subprocess targeting this vCenter
    pub fn govc_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("GOVC_URL", self.server.clone()),
            ("GOVC_USERNAME", self.credentials.username.clone()),
            ("GOVC_PASSWORD", self.credentials.password.clone()),
            ("GOVC_INSECURE", self.insecure.to_string()),
            ("GOVC_DATACENTER", self.datacenter.clone()),
        ]
    }
}
