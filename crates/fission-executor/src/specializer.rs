//! Loading a function into a runtime pod.
//!
//! The pool manager never talks to the fetcher directly; it goes through
//! the [`Specializer`] seam so tests can specialize without a network.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use fission_client::{FetchRequest, FetchType, FetcherClient, LoadRequest, SpecializeRequest};
use fission_core::{AllowedFunctionsPerContainer, Environment, FissionResult, Function};
use fission_orchestrator::Container;

/// Directory the fetcher and runtime containers share.
pub const SHARED_MOUNT_PATH: &str = "/userfunc";

pub const FETCHER_IMAGE: &str = "fission/fetcher";
pub const FETCHER_SERVICE_ACCOUNT: &str = "fission-fetcher";

/// Boxed future returned by [`Specializer::specialize`].
pub type SpecializeFuture<'a> = Pin<Box<dyn Future<Output = FissionResult<()>> + Send + 'a>>;

/// Asks a pod's fetcher sidecar to load a function.
pub trait Specializer: Send + Sync {
    fn specialize<'a>(&'a self, fetcher_url: &'a str, req: &'a SpecializeRequest) -> SpecializeFuture<'a>;
}

/// [`Specializer`] over HTTP, with the fetcher client's retry policy.
#[derive(Debug, Clone)]
pub struct FetcherSpecializer {
    attempt_timeout: Duration,
}

impl FetcherSpecializer {
    pub fn new(attempt_timeout: Duration) -> Self {
        Self { attempt_timeout }
    }
}

impl Default for FetcherSpecializer {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl Specializer for FetcherSpecializer {
    fn specialize<'a>(&'a self, fetcher_url: &'a str, req: &'a SpecializeRequest) -> SpecializeFuture<'a> {
        Box::pin(async move {
            FetcherClient::new(fetcher_url)
                .with_attempt_timeout(self.attempt_timeout)
                .specialize(req)
                .await
                .map_err(Into::into)
        })
    }
}

/// The fetch + load request for `function` on `env`.
pub fn specialize_request(function: &Function, env: &Environment) -> SpecializeRequest {
    let filename = if env.spec.version >= 2 {
        match env.spec.allowed_functions_per_container {
            // Several functions share the pod; keep their code apart.
            AllowedFunctionsPerContainer::Infinite => function.metadata.uid.clone(),
            AllowedFunctionsPerContainer::Single => "deployarchive".to_string(),
        }
    } else {
        "user".to_string()
    };

    SpecializeRequest {
        fetch_req: FetchRequest {
            fetch_type: FetchType::Deployment,
            package: function.spec.package.package_ref.clone(),
            url: String::new(),
            filename: filename.clone(),
            secrets: function.spec.secrets.clone(),
            config_maps: function.spec.config_maps.clone(),
            keep_archive: env.spec.keeparchive,
        },
        load_req: LoadRequest {
            filepath: format!("{SHARED_MOUNT_PATH}/{filename}"),
            function_name: function.spec.package.function_name.clone(),
            url: String::new(),
            function_metadata: Some(function.metadata.clone()),
            env_version: env.spec.version,
        },
    }
}

/// The fetcher sidecar. With `startup_request` it specializes the pod as
/// soon as it starts instead of waiting for a call.
pub fn fetcher_container(port: u16, startup_request: Option<&SpecializeRequest>) -> FissionResult<Container> {
    let mut args = vec!["-port".to_string(), port.to_string()];
    if let Some(req) = startup_request {
        let body = serde_json::to_string(req)
            .map_err(|e| fission_core::FissionError::internal(format!("encoding specialize request: {e}")))?;
        args.extend(["-specialize-on-startup".to_string(), "-specialize-request".to_string(), body]);
    }
    args.push(SHARED_MOUNT_PATH.to_string());
    Ok(Container {
        name: "fetcher".to_string(),
        image: FETCHER_IMAGE.to_string(),
        args,
        ports: vec![port],
        ..Default::default()
    })
}

/// `host` formatted for use in a URL authority: IPv6 literals are bracketed.
pub fn url_host(ip: &str) -> String {
    if ip.contains(':') && !ip.starts_with('[') {
        format!("[{ip}]")
    } else {
        ip.to_string()
    }
}

/// Base URL of the fetcher sidecar in the pod at `ip`.
pub fn fetcher_url(ip: &str, port: u16) -> String {
    format!("http://{}:{port}", url_host(ip))
}

#[cfg(test)]
mod tests {
    use fission_core::{ObjectMeta, PackageRef};

    use super::*;

    fn function() -> Function {
        let mut f = Function {
            metadata: ObjectMeta {
                uid: "f-uid".into(),
                ..ObjectMeta::new("default", "hello")
            },
            ..Default::default()
        };
        f.spec.package.package_ref = PackageRef {
            namespace: "default".into(),
            name: "hello-pkg".into(),
            resource_version: "12".into(),
        };
        f.spec.package.function_name = "main".into();
        f
    }

    #[test]
    fn v2_environments_load_the_deploy_archive() {
        let mut env = Environment::default();
        env.spec.keeparchive = true;
        let req = specialize_request(&function(), &env);
        assert_eq!(req.fetch_req.filename, "deployarchive");
        assert_eq!(req.fetch_req.fetch_type, FetchType::Deployment);
        assert_eq!(req.fetch_req.package.resource_version, "12");
        assert!(req.fetch_req.keep_archive);
        assert_eq!(req.load_req.filepath, "/userfunc/deployarchive");
        assert_eq!(req.load_req.function_name, "main");
        assert_eq!(req.load_req.env_version, 2);
        assert_eq!(req.load_req.function_metadata.unwrap().name, "hello");
    }

    #[test]
    fn shared_pods_load_by_uid_and_v1_by_fixed_name() {
        let mut env = Environment::default();
        env.spec.allowed_functions_per_container = AllowedFunctionsPerContainer::Infinite;
        assert_eq!(specialize_request(&function(), &env).load_req.filepath, "/userfunc/f-uid");

        env.spec.version = 1;
        assert_eq!(specialize_request(&function(), &env).fetch_req.filename, "user");
    }

    #[test]
    fn startup_fetcher_carries_the_request() {
        let req = specialize_request(&function(), &Environment::default());
        let idle = fetcher_container(8000, None).unwrap();
        assert_eq!(idle.args, ["-port", "8000", "/userfunc"]);

        let eager = fetcher_container(8000, Some(&req)).unwrap();
        let pos = eager.args.iter().position(|a| a == "-specialize-request").unwrap();
        let decoded: SpecializeRequest = serde_json::from_str(&eager.args[pos + 1]).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn ipv6_fetcher_urls_are_bracketed() {
        assert_eq!(fetcher_url("10.0.0.5", 8000), "http://10.0.0.5:8000");
        assert_eq!(fetcher_url("fd00::5", 8000), "http://[fd00::5]:8000");
    }
}
