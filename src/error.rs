use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("failed to open process {pid}")]
    OpenFailed {
        pid: u32,
        #[source]
        source: Box<RegionError>,
    },

    #[error("memory query failed at the first address of process {pid}")]
    FirstQueryFailed { pid: u32 },

    #[error("{call} failed with error {code}")]
    Os { call: &'static str, code: u32 },

    #[error("partial read at {address:#x}: {actual} of {expected} bytes")]
    PartialRead {
        address: u64,
        expected: usize,
        actual: usize,
    },
}

pub type Result<T> = std::result::Result<T, RegionError>;
