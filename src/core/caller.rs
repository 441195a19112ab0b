// Identity of the process or thread issuing a device operation, for logging.
use std::path::Path;

/// Longest program name kept, matching the kernel's task `comm` field.
const COMM_MAX: usize = 15;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Caller {
    pub comm: String,
    pub pid: u32,
}

impl Caller {
    pub fn new(comm: impl Into<String>, pid: u32) -> Self {
        Self {
            comm: truncate_comm(comm.into()),
            pid,
        }
    }

    /// The running program, named after the file name of `argv[0]`.
    pub fn current() -> Self {
        let comm = std::env::args_os()
            .next()
            .and_then(|arg0| {
                Path::new(&arg0)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(comm, std::process::id())
    }
}

fn truncate_comm(mut comm: String) -> String {
    if comm.len() > COMM_MAX {
        let mut end = COMM_MAX;
        while !comm.is_char_boundary(end) {
            end -= 1;
        }
        comm.truncate(end);
    }
    comm
}
