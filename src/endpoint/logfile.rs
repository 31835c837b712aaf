use std::{io::Write, path::Path};

use tracing::{error, info, info_span};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::{
    endpoint::{Connection, EndpointType},
    error::Error,
};

/// Open a daily rolling log file and return the sink feeding it.
///
/// Files are named `<refdes>.<date>.<suffix>` inside `dir`.
/// Writing happens on a blocking thread; when the file can not be written
/// the sink closes and the router drops it.
pub fn spawn(
    endpoint_type: EndpointType,
    dir: &Path,
    refdes: &str,
    suffix: &str,
) -> Result<Connection, Error> {
    let mut appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(refdes)
        .filename_suffix(suffix)
        .build(dir)
        .map_err(|e| Error::LogFile {
            dir: dir.to_path_buf(),
            problem: e.to_string(),
        })?;

    let (connection, receiver) = Connection::new(endpoint_type);

    let span = info_span!("logfile", %refdes, %suffix);
    tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        info!("Writing log file");

        for chunk in futures::executor::block_on_stream(receiver) {
            if let Err(e) = appender.write_all(&chunk) {
                error!(?e, "Could not write log file, closing it");
                return;
            }
        }

        let _ = appender.flush();
    });

    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn writes_land_in_the_file() {
        let dir = std::env::temp_dir().join(format!("port-agent-logfile-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let connection = spawn(EndpointType::Logger, &dir, "CE01ISSM-MFD35", "log").unwrap();
        connection.write(Bytes::from_static(b"first\n")).unwrap();
        connection.write(Bytes::from_static(b"second\n")).unwrap();
        drop(connection);

        let mut contents = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let file = std::fs::read_dir(&dir)
                .unwrap()
                .filter_map(Result::ok)
                .find(|entry| entry.file_name().to_string_lossy().starts_with("CE01ISSM-MFD35"));
            if let Some(file) = file {
                contents = std::fs::read_to_string(file.path()).unwrap();
                if contents.len() == 13 {
                    break;
                }
            }
        }

        assert_eq!(contents, "first\nsecond\n");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
