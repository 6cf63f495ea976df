use strato_storage::{DiskError, FileBackend, RawDisk, StorageBackend, VirtualDisk};

#[test]
fn create_write_reopen_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");

    {
        let backend = FileBackend::create(&path, 4096).unwrap();
        let mut disk = RawDisk::create(backend, 4096).unwrap();
        disk.write_at(512, &[0xABu8; 512]).unwrap();
        disk.flush().unwrap();
    }

    let backend = FileBackend::open(&path).unwrap();
    assert_eq!(backend.len(), 4096);
    let mut disk = RawDisk::open(backend).unwrap();
    let mut out = [0u8; 512];
    disk.read_at(512, &mut out).unwrap();
    assert_eq!(out, [0xABu8; 512]);
}

#[test]
fn read_only_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.img");
    FileBackend::create(&path, 1024).unwrap();

    let mut backend = FileBackend::open_read_only(&path).unwrap();
    let err = backend.write_at(0, &[1u8; 16]).unwrap_err();
    assert!(matches!(err, DiskError::ReadOnly));
    backend.flush().unwrap();
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = FileBackend::open(dir.path().join("absent.img")).unwrap_err();
    assert!(matches!(err, DiskError::Io));
}
