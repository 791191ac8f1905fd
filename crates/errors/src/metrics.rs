use metrics::register_yesquel_counter;

register_yesquel_counter!(pub FATAL_ERROR_TOTAL, "Count of fatal errors that aborted the process");

pub fn log_fatal_error() {
    FATAL_ERROR_TOTAL.inc();
}
