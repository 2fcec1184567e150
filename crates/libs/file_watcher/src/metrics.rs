use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram_vec, register_int_counter_vec, HistogramVec,
    IntCounterVec,
};

pub(crate) static UPLOAD_DETECT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "upload_detect",
        "Number of file update detections",
        &["folder"]
    )
    .expect("register upload_detect")
});

pub(crate) static UPLOAD_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "upload_dropped",
        "Number of file update detections that did not trigger an upload",
        &["folder"]
    )
    .expect("register upload_dropped")
});

pub(crate) static UPLOAD_SUCCESS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "upload_success",
        "Number of successful file uploads",
        &["folder"]
    )
    .expect("register upload_success")
});

pub(crate) static UPLOAD_ERROR: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("upload_error", "Number of failed file uploads", &["folder"])
        .expect("register upload_error")
});

pub(crate) static UPLOAD_CANCEL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "upload_cancel",
        "Number of uploads abandoned before completion",
        &["folder"]
    )
    .expect("register upload_cancel")
});

pub(crate) static UPLOAD_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "upload_duration",
        "Duration of file uploads (seconds)",
        &["folder"],
        exponential_buckets(1.0, 2.0, 16).expect("upload_duration buckets")
    )
    .expect("register upload_duration")
});
