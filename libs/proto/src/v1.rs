//! Version 1 of the function run envelope.

use std::time::Duration;

/// A request to run one function image against an input payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunFunctionRequest {
    /// OCI image reference, e.g. `registry.example/fn:v1`.
    #[prost(string, tag = "1")]
    pub image: ::prost::alloc::string::String,

    /// Opaque bytes written to the function's stdin.
    #[prost(bytes = "vec", tag = "2")]
    pub input: ::prost::alloc::vec::Vec<u8>,

    /// How the image should be pulled.
    #[prost(message, optional, tag = "3")]
    pub image_pull_config: ::core::option::Option<ImagePullConfig>,

    /// How the function should be run.
    #[prost(message, optional, tag = "4")]
    pub run_function_config: ::core::option::Option<RunFunctionConfig>,
}

impl RunFunctionRequest {
    /// The requested execution timeout, if one was set and is positive.
    pub fn timeout(&self) -> Option<Duration> {
        self.run_function_config
            .as_ref()
            .and_then(|c| c.timeout)
            .and_then(|t| Duration::try_from(t).ok())
            .filter(|d| !d.is_zero())
    }
}

/// The output of a successful function run.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunFunctionResponse {
    /// Everything the function wrote to stdout.
    #[prost(bytes = "vec", tag = "1")]
    pub output: ::prost::alloc::vec::Vec<u8>,
}

/// Image pull settings supplied by the caller.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImagePullConfig {
    #[prost(enumeration = "ImagePullPolicy", tag = "1")]
    pub pull_policy: i32,

    #[prost(message, optional, tag = "2")]
    pub auth: ::core::option::Option<ImagePullAuth>,
}

/// Registry credentials. Passed through to the registry, never logged.
#[derive(Clone, PartialEq, ::prost::Message)]
#[prost(skip_debug)]
pub struct ImagePullAuth {
    #[prost(string, tag = "1")]
    pub username: ::prost::alloc::string::String,

    #[prost(string, tag = "2")]
    pub password: ::prost::alloc::string::String,

    /// Base64 encoded `username:password`.
    #[prost(string, tag = "3")]
    pub auth: ::prost::alloc::string::String,

    /// Refresh token exchanged at the registry's token endpoint.
    #[prost(string, tag = "4")]
    pub identity_token: ::prost::alloc::string::String,

    /// Bearer token sent to the registry as-is.
    #[prost(string, tag = "5")]
    pub registry_token: ::prost::alloc::string::String,
}

impl std::fmt::Debug for ImagePullAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |s: &str| if s.is_empty() { "" } else { "<redacted>" };
        f.debug_struct("ImagePullAuth")
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("auth", &redact(&self.auth))
            .field("identity_token", &redact(&self.identity_token))
            .field("registry_token", &redact(&self.registry_token))
            .finish()
    }
}

/// When the runner may contact the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ImagePullPolicy {
    /// Treated the same as [`ImagePullPolicy::Always`].
    Unspecified = 0,
    /// Use a cached image for a tag without asking the registry.
    IfNotPresent = 1,
    /// Revalidate tags against the registry on every run.
    Always = 2,
    /// Never contact the registry.
    Never = 3,
}

/// Execution settings for one run.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunFunctionConfig {
    /// Hard deadline for pulling and running the function.
    #[prost(message, optional, tag = "1")]
    pub timeout: ::core::option::Option<::prost_types::Duration>,
}
