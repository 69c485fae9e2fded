//! Query API for route-layer consumption
//!
//! Provides high-level query functions that return data shaped for the
//! portal's email views.

mod threads;

pub use threads::{
    ThreadDetail, ThreadSummary, get_thread_detail, list_threads, list_threads_by_label,
};
