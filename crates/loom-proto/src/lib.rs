//! Generated protobuf types and gRPC service stubs.

pub mod minion {
    tonic::include_proto!("loom.minion");
}

pub mod api {
    tonic::include_proto!("loom.api");
}
