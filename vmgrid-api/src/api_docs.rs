use crate::error::ErrorResponse;
use crate::handlers::{backends, events, instances};
use utoipa::OpenApi;
use vmgrid_common::{CreateInstanceRequest, InstanceRecord, InstanceState, ListInstancesResponse};

#[derive(OpenApi)]
#[openapi(
    paths(
        // Instances
        instances::create_instance,
        instances::list_instances,
        instances::get_instance,
        instances::terminate_instance,
        // Backends
        backends::list_backends,
        // Events
        events::events_stream
    ),
    components(
        schemas(
            CreateInstanceRequest,
            InstanceRecord,
            InstanceState,
            ListInstancesResponse,
            ErrorResponse,
            backends::BackendHealthResponse
        )
    ),
    tags(
        (name = "vmgrid", description = "Instance provisioning orchestrator API")
    )
)]
pub struct ApiDoc;
