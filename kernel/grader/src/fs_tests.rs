//! Exercises the file system (`kernel::fs`/`kernel::inode`/`kernel::block_cache`)
//! directly through `keos::fs`, without going through a syscall ABI.

use kernel::file_struct::{FileStruct, STDERR, STDIN, STDOUT};
use keos::syscall::flags::FileMode;

pub fn create_open_write_read() {
    let mut files = FileStruct::new();
    files.create("greeting", false).expect("create");

    let fd = files.open("greeting", FileMode::ReadWrite).expect("open");
    assert_eq!(files.write(fd, b"hello, world").unwrap(), 12);
    files.seek(fd, 0).unwrap();

    let mut buf = [0u8; 12];
    assert_eq!(files.read(fd, &mut buf).unwrap(), 12);
    assert_eq!(&buf, b"hello, world");
    assert_eq!(files.tell(fd).unwrap(), 12);
    assert_eq!(files.filesize(fd).unwrap(), 12);

    files.close(fd).unwrap();
    files.remove("greeting").unwrap();
    assert!(files.open("greeting", FileMode::Read).is_err());
}

pub fn directories() {
    let mut files = FileStruct::new();
    files.create("etc", true).expect("mkdir");
    files.chdir("etc").expect("chdir");
    files.create("os-release", false).expect("create in etc");

    let dirfd = files.open(".", FileMode::Read).expect("open cwd");
    assert!(files.isdir(dirfd).unwrap());
    let mut names = alloc::vec::Vec::new();
    while let Some(name) = files.readdir(dirfd).unwrap() {
        names.push(name);
    }
    assert!(names.iter().any(|n| n == "os-release"));
    files.close(dirfd).unwrap();
}

pub fn reopen_shares_growth() {
    let mut files = FileStruct::new();
    files.create("shared", false).unwrap();
    let a = files.open("shared", FileMode::Write).unwrap();
    let b = files.open("shared", FileMode::Read).unwrap();

    files.write(a, b"0123456789").unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(files.read(b, &mut buf).unwrap(), 10);
    assert_eq!(&buf, b"0123456789");

    files.close(a).unwrap();
    files.close(b).unwrap();
}

pub fn stdio_descriptors_preinstalled() {
    let files = FileStruct::new();
    assert!(files.tell(STDIN).is_err());
    assert!(files.tell(STDOUT).is_err());
    assert!(files.tell(STDERR).is_err());
}
