mod parameterize;
mod resolver;

pub use parameterize::parameterize;
pub use resolver::{
    resolve_service, ClusterResolver, KubectlResolver, CLUSTER_LOOKUP_TIMEOUT, UNKNOWN_SERVICE,
};
