mod bucket;
mod claim;

pub use bucket::*;
pub use claim::*;

pub static API_GROUP: &str = "objectbucket.io";

/// Finalizer set on every claim, bucket record, secret and config map this controller manages
pub static FINALIZER: &str = "objectbucket.io/finalizer";

/// Storage class parameter naming an existing bucket (static provisioning)
pub static STORAGE_CLASS_BUCKET: &str = "bucketName";
