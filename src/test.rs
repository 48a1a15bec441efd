use super::device::{FlashImage, RamFlash};
use super::fs::{
    read_file, write_file, FileStorage, FsError, Mbfs, TinyFs, Whence, MB_CREAT, MB_READ,
    MB_WRITE, PAGE_SIZE,
};
use std::sync::Arc;

fn hello_world<S: FileStorage>(fs: &mut S) {
    let filea = fs.open("filea", MB_CREAT | MB_WRITE | MB_READ).unwrap();
    let fileb = fs.open("fileb", MB_CREAT | MB_WRITE).unwrap();
    fs.close(fileb).unwrap();

    let greet_str = "Hello, world!";
    assert_eq!(fs.write(filea, greet_str.as_bytes()).unwrap(), greet_str.len());
    fs.seek(filea, 0, Whence::Set).unwrap();
    let mut buffer = [0u8; 233];
    let len = fs.read(filea, &mut buffer).unwrap();
    assert_eq!(greet_str, core::str::from_utf8(&buffer[..len]).unwrap());

    // 越过末尾写入, 中间补 0
    assert_eq!(fs.write_at(filea, 20, b"!").unwrap(), 1);
    fs.seek(filea, -8, Whence::End).unwrap();
    let len = fs.read(filea, &mut buffer).unwrap();
    assert_eq!(&buffer[..len], b"\0\0\0\0\0\0\0!");
    fs.close(filea).unwrap();

    assert_eq!(read_file(fs, "fileb").unwrap(), b"");
    fs.remove("fileb").unwrap();
    assert_eq!(fs.open("fileb", MB_READ), Err(FsError::InvalidParameter));
}

fn random_str_test<S: FileStorage>(fs: &mut S, len: usize) {
    let mut str = String::new();
    // random digit
    for _ in 0..len {
        str.push(char::from(b'0' + rand::random::<u8>() % 10));
    }
    assert_eq!(write_file(fs, "filea", str.as_bytes()).unwrap(), len);

    let fd = fs.open("filea", MB_READ).unwrap();
    let mut read_buffer = [0u8; 127];
    let mut read_str = String::new();
    loop {
        let len = fs.read(fd, &mut read_buffer).unwrap();
        if len == 0 {
            break;
        }
        read_str.push_str(core::str::from_utf8(&read_buffer[..len]).unwrap());
    }
    fs.close(fd).unwrap();
    assert_eq!(str, read_str);
}

#[test]
fn tinyfs_test() {
    let mut fs = TinyFs::mount(Arc::new(RamFlash::new(41)), 0, 0).unwrap();
    hello_world(&mut fs);

    random_str_test(&mut fs, 4 * PAGE_SIZE);
    random_str_test(&mut fs, 8 * PAGE_SIZE + PAGE_SIZE / 2);
    random_str_test(&mut fs, 20 * PAGE_SIZE + PAGE_SIZE / 7);
    random_str_test(&mut fs, 3);
    // 最大的文件占满全部数据块
    random_str_test(&mut fs, 39 * PAGE_SIZE);
    fs.remove("filea").unwrap();
    assert_eq!(fs.free_blocks().unwrap(), 39);
}

#[test]
fn mbfs_test() {
    let mut fs = Mbfs::mount(Arc::new(RamFlash::new(65)), 0, 0).unwrap();
    hello_world(&mut fs);

    let block = 256;
    random_str_test(&mut fs, 4 * block);
    random_str_test(&mut fs, 8 * block + block / 2);
    random_str_test(&mut fs, 100 * block);
    random_str_test(&mut fs, 70 * block + block / 7);
    random_str_test(&mut fs, 5);
    // 剩余的 UNUSED 块不够, 必须回收之前删除的块
    random_str_test(&mut fs, 200 * block);
    random_str_test(&mut fs, 150 * block);
}

#[test]
fn image_survives_remount() -> std::io::Result<()> {
    let path = std::env::temp_dir().join(format!("flash-fs-remount-{}.img", std::process::id()));
    {
        let device = Arc::new(FlashImage::create(&path, 32, 0)?);
        let mut fs = Mbfs::mount(device, 0, 0).unwrap();
        fs.create_directory("etc").unwrap();
        write_file(&mut fs, "etc/motd", b"persisted").unwrap();
        write_file(&mut fs, "top", &[7u8; 700]).unwrap();
    }

    let device = Arc::new(FlashImage::open(&path, 0)?);
    let mut fs = Mbfs::mount(device, 0, 0).unwrap();
    assert_eq!(read_file(&mut fs, "etc/motd").unwrap(), b"persisted");
    assert_eq!(read_file(&mut fs, "top").unwrap(), vec![7u8; 700]);
    let names: Vec<String> = fs.list_dir("/").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, ["etc", "top"]);
    drop(fs);
    std::fs::remove_file(path)
}
