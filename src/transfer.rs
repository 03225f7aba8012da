use std::io::{Read, Write};
use std::sync::mpsc::Sender;

use crate::app::progress::ProgressMonitor;
use crate::error::TransferError;
use crate::keys::KeyStore;
use crate::model::{Credential, SharedObject, TransferOutcome, TransferRequest, TransferUpdate};
use crate::ssh::{AuthStrategy, Connector, FileChannel};

const CHUNK_SIZE: usize = 32 * 1024;

/// Disconnects the channel and its session when dropped.
struct Connected(Box<dyn FileChannel>);

impl Drop for Connected {
    fn drop(&mut self) {
        self.0.disconnect();
    }
}

/// Uploads `shared` as `destination_name` into the channel's directory,
/// refusing to touch a name that already exists there.
pub(crate) fn send(
    channel: Box<dyn FileChannel>,
    progress: &mut ProgressMonitor,
    shared: &SharedObject,
    destination_name: &str,
) -> Result<(), TransferError> {
    let mut channel = Connected(channel);
    progress.init(shared.size());

    if channel.0.exists(destination_name)? {
        return Err(TransferError::FileExists(destination_name.to_string()));
    }

    let mut source = shared.open()?;
    let mut remote = channel.0.create(destination_name)?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = source
            .read(&mut buffer)
            .map_err(|err| TransferError::network(&format!("read {}", shared.name()), err))?;
        if read == 0 {
            break;
        }
        remote
            .write_all(&buffer[..read])
            .map_err(|err| TransferError::network("write remote file", err))?;
        progress.count(read as u64);
    }
    remote
        .flush()
        .map_err(|err| TransferError::network("flush remote file", err))?;
    Ok(())
}

/// Runs one attempt on the calling thread: resolve the credential, connect,
/// upload. `None` means authenticate with the stored key pair.
pub(crate) fn run_attempt(
    connector: &dyn Connector,
    keys: &KeyStore,
    request: &TransferRequest,
    credential: Option<Credential>,
    tx: &Sender<TransferUpdate>,
) -> TransferOutcome {
    let result = (|| -> Result<(), TransferError> {
        let credential = match credential {
            Some(credential) => credential,
            None => AuthStrategy::public_key(keys, request, tx)?,
        };
        let auth = AuthStrategy::from_credential(credential, tx.clone());
        let channel = connector.connect(request, &auth)?;
        let mut progress = ProgressMonitor::new(tx.clone());
        let result = send(channel, &mut progress, &request.shared, request.destination_name());
        progress.end();
        result
    })();
    TransferOutcome::from(result)
}
