//! The subset of the control plane's schema read by the resource manager.

diesel::table! {
    allocations (allocation_id) {
        allocation_id -> Text,
        task_id -> Text,
        resource_pool -> Nullable<Text>,
        start_time -> Nullable<Timestamptz>,
        end_time -> Nullable<Timestamptz>,
    }
}
