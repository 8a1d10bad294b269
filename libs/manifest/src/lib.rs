//! Declarative provider integrations. A `ProviderManifest` describes how to
//! call a vendor fax API; `ManifestRuntime` interprets it for send, status
//! polling, and cancellation without any vendor-specific code.

pub mod runtime;
pub mod schema;
pub mod template;

pub use runtime::{ActionOutcome, ManifestRuntime, SendRequest};
pub use schema::{
    AuthConfig, AuthScheme, BodyKind, BodySpec, HttpAction, ManifestError, PathParam,
    ProviderManifest, ResponseMap,
};
pub use template::{PathExpr, extract, render};
