//! Typed job arguments.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Ties an argument type to its job kind.
///
/// # Example
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl JobArgs for SendEmail {
///     const KIND: &'static str = "send_email";
/// }
/// ```
///
/// # Trait bounds
/// - `Serialize`: args are stored on the job row as JSON.
/// - `DeserializeOwned`: args are decoded back from the row at execution.
/// - `Send + Sync + 'static`: args cross task boundaries.
pub trait JobArgs: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The kind string this args type is registered under.
    const KIND: &'static str;
}
