use log::trace;
use probe_data::Execution;
use std::future::Future;
use std::io;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;
use std::time::Duration;
use tempfile::{TempDir, TempPath};
use tokio::process::Command;

const SPAWN_ATTEMPTS: usize = 20;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Runs a harness image in isolation and reports what happened.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        image: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Execution>> + Send;
}

/// Runs images as native child processes.
///
/// Every execution gets its own uniquely named file inside a private scratch
/// directory, so concurrent workers never see each other's images.
pub struct NativeExecutor {
    scratch: TempDir,
}

impl NativeExecutor {
    pub fn new() -> io::Result<Self> {
        let scratch = tempfile::Builder::new().prefix("find-nop-").tempdir()?;
        trace!("Scratch directory {:?}", scratch.path());
        Ok(Self { scratch })
    }

    fn stage(&self, image: &[u8]) -> io::Result<TempPath> {
        let mut file = tempfile::Builder::new()
            .prefix("harness-")
            .tempfile_in(self.scratch.path())?;
        file.write_all(image)?;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o700))?;
        // closes our handle, the path is removed on drop
        Ok(file.into_temp_path())
    }

    async fn spawn(path: &TempPath) -> io::Result<tokio::process::Child> {
        let mut attempt = 0;
        loop {
            let spawned = Command::new(path.as_os_str())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();

            // another thread forking while our image was still open for writing makes
            // `execve` fail with "text file busy" for a moment
            match spawned {
                Err(err) if is_text_busy(&err) && attempt < SPAWN_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(SPAWN_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }
}

fn is_text_busy(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ExecutableFileBusy
}

impl Executor for NativeExecutor {
    fn execute(
        &self,
        image: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Execution>> + Send {
        let staged = self.stage(image);

        async move {
            let path = staged?;
            let child = Self::spawn(&path).await?;

            // dropping the child on timeout kills it
            let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Err(_) => {
                    trace!("Execution of {:?} timed out", path);
                    return Ok(Execution::TimedOut);
                }
                Ok(output) => output?,
            };

            if output.status.success() {
                Ok(Execution::Completed(output.stdout))
            } else {
                trace!("Harness {:?} terminated with {}", path, output.status);
                Ok(Execution::Crashed(output.stdout))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::elf;
    use iced_x86::code_asm::{self, CodeAssembler};

    /// Assembles `build` into an i386 image.
    pub(crate) fn image(build: impl FnOnce(&mut CodeAssembler)) -> Vec<u8> {
        let mut a = CodeAssembler::new(32).unwrap();
        build(&mut a);
        elf::wrap(&a.assemble(elf::entry_point() as u64).unwrap())
    }

    pub(crate) fn exit_image(status: i32) -> Vec<u8> {
        image(|a| {
            a.mov(code_asm::eax, 1).unwrap();
            a.mov(code_asm::ebx, status).unwrap();
            a.int(0x80).unwrap();
        })
    }

    /// `None` when this host cannot run i386 images, the native tests then skip.
    pub(crate) async fn native_executor() -> Option<NativeExecutor> {
        if !cfg!(all(
            target_os = "linux",
            any(target_arch = "x86_64", target_arch = "x86")
        )) {
            return None;
        }

        let executor = NativeExecutor::new().ok()?;
        match executor
            .execute(&exit_image(0), Duration::from_secs(5))
            .await
        {
            Ok(Execution::Completed(_)) => Some(executor),
            other => {
                eprintln!("Skipping native test, no i386 support: {other:?}");
                None
            }
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_text_busy_is_retried() {
        // ETXTBSY
        assert!(is_text_busy(&io::Error::from_raw_os_error(26)));
        assert!(!is_text_busy(&io::Error::from(io::ErrorKind::NotFound)));
    }

    #[tokio::test]
    async fn test_exit_status() {
        let Some(executor) = native_executor().await else {
            return;
        };

        let result = executor
            .execute(&exit_image(3), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, Execution::Crashed(vec![]));
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let Some(executor) = native_executor().await else {
            return;
        };

        let hello = image(|a| {
            a.push(0x6f6c_6c65).unwrap(); // "ello"
            a.push(0x4848_4848u32 as i32).unwrap();
            a.mov(code_asm::eax, 4).unwrap();
            a.mov(code_asm::ebx, 1).unwrap();
            a.mov(code_asm::ecx, code_asm::esp).unwrap();
            a.mov(code_asm::edx, 8).unwrap();
            a.int(0x80).unwrap();
            a.mov(code_asm::eax, 1).unwrap();
            a.xor(code_asm::ebx, code_asm::ebx).unwrap();
            a.int(0x80).unwrap();
        });

        let result = executor
            .execute(&hello, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, Execution::Completed(b"HHHHello".to_vec()));
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let Some(executor) = native_executor().await else {
            return;
        };

        let spin = image(|a| {
            let mut label = a.create_label();
            a.set_label(&mut label).unwrap();
            a.jmp(label).unwrap();
        });

        let started = std::time::Instant::now();
        let result = executor
            .execute(&spin, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(result, Execution::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_trap_is_crash() {
        let Some(executor) = native_executor().await else {
            return;
        };

        let trap = image(|a| a.int3().unwrap());
        let result = executor
            .execute(&trap, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, Execution::Crashed(vec![]));
    }
}
