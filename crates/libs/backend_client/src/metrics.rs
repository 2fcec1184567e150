use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

pub(crate) static MEDIA_TRANSFER_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "media_transferred_count",
        "Number of media (picture and video) files transferred",
        &["mimetype"]
    )
    .expect("register media_transferred_count")
});

pub(crate) static MEDIA_TRANSFER_ERROR: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "media_transferred_errors",
        "Number of media (picture and video) files failed to transfer",
        &["mimetype"]
    )
    .expect("register media_transferred_errors")
});

pub(crate) static MEDIA_TRANSFER_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "media_transferred_bytes",
        "Media (picture and video) bytes transferred",
        &["mimetype"]
    )
    .expect("register media_transferred_bytes")
});

pub(crate) static MEDIA_TRANSFER_BYTES_ERROR: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "media_transferred_bytes_error",
        "Media (picture and video) bytes transferred before returning error",
        &["mimetype"]
    )
    .expect("register media_transferred_bytes_error")
});

pub(crate) static MEDIA_TRANSFER_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "media_transferred_seconds",
        "Transfer time for files (seconds)",
        &["mimetype"],
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 180.0, 600.0, 1800.0]
    )
    .expect("register media_transferred_seconds")
});

pub(crate) static MEDIA_FILE_SIZE: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "media_file_size",
        "Media file sizes (bytes)",
        &["mimetype"],
        vec![
            // picture-sized buckets
            512.0 * 1024.0,
            1024.0 * 1024.0,
            4.0 * 1024.0 * 1024.0,
            16.0 * 1024.0 * 1024.0,
            32.0 * 1024.0 * 1024.0,
            // video-sized buckets
            128.0 * 1024.0 * 1024.0,
            512.0 * 1024.0 * 1024.0,
            1024.0 * 1024.0 * 1024.0,
            2.0 * 1024.0 * 1024.0 * 1024.0,
            4.0 * 1024.0 * 1024.0 * 1024.0,
            8.0 * 1024.0 * 1024.0 * 1024.0,
        ]
    )
    .expect("register media_file_size")
});
