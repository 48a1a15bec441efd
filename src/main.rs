use std::{
    fs::{read_dir, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};

use flash_fs::device::FlashImage;
use flash_fs::fs::mbfs::is_valid_filename;
use flash_fs::fs::{
    write_file, FsError, Mbfs, Whence, MB_READ, MB_SEEK_CUR, MB_SEEK_END, MB_SEEK_SET,
};

/// 在宿主机上制作和查看 MBFS 闪存镜像
#[derive(Parser)]
#[command(name = "flash-fs", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// 固件在镜像中结束的偏移, 文件系统从其后的第一个整页开始
    #[arg(long, default_value_t = 0)]
    code_end: usize,
}

#[derive(Subcommand)]
enum Command {
    /// 新建镜像, 把 source 目录下的文件全部写入根目录
    Pack {
        source: PathBuf,
        image: PathBuf,
        /// 镜像大小 (页)
        #[arg(long, default_value_t = 128)]
        pages: usize,
    },
    /// 列出镜像中的目录
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        dir: String,
    },
    /// 把镜像中的文件输出到标准输出
    Cat {
        image: PathBuf,
        file: String,
        /// 开始读取的偏移, 相对于 --whence
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        offset: i32,
        /// set, cur 或 end
        #[arg(long, default_value = "set", value_parser = parse_whence)]
        whence: u8,
    },
}

fn parse_whence(s: &str) -> Result<u8, String> {
    match s {
        "set" => Ok(MB_SEEK_SET),
        "cur" => Ok(MB_SEEK_CUR),
        "end" => Ok(MB_SEEK_END),
        _ => Err(format!("unknown whence `{}`", s)),
    }
}

fn fs_err(e: FsError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{} (code {})", e, e.code()))
}

fn cat(fs: &mut Mbfs, file: &str, offset: i32, whence: u8) -> io::Result<()> {
    let whence = Whence::from_flags(whence).map_err(fs_err)?;
    let fd = fs.open(file, MB_READ).map_err(fs_err)?;
    let mut out = io::stdout().lock();
    let mut buf = [0u8; 256];
    let copied = fs.seek(fd, offset, whence).and_then(|_| loop {
        match fs.read(fd, &mut buf)? {
            0 => break Ok(()),
            n => {
                if out.write_all(&buf[..n]).is_err() {
                    break Err(FsError::Cancelled);
                }
            }
        }
    });
    let closed = fs.close(fd);
    copied.and(closed).map_err(fs_err)
}

fn mount(image: &Path, code_end: usize) -> io::Result<Mbfs> {
    let device = Arc::new(FlashImage::open(image, code_end)?);
    Mbfs::mount(device, 0, 0).map_err(fs_err)
}

fn list(fs: &Mbfs, dir: &str) -> io::Result<()> {
    for entry in fs.list_dir(dir).map_err(fs_err)? {
        if entry.is_directory {
            println!("{}/", entry.name);
        } else {
            println!("{:>8} {}", entry.length, entry.name);
        }
    }
    Ok(())
}

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Pack {
            source,
            image,
            pages,
        } => {
            println!("source={:?}\nimage={:?}", source, image);
            let device = Arc::new(FlashImage::create(&image, pages, cli.code_end)?);
            let mut fs = Mbfs::mount(device, 0, 0).map_err(fs_err)?;

            for entry in read_dir(&source)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if !is_valid_filename(&name) || name.contains('/') {
                    log::warn!("skipping {}: not a valid filename", name);
                    continue;
                }
                let mut data = Vec::new();
                File::open(entry.path())?.read_to_end(&mut data)?;
                log::info!("packing {} ({} bytes)", name, data.len());
                let written = write_file(&mut fs, &name, &data).map_err(fs_err)?;
                if written < data.len() {
                    log::warn!("{}: only {} of {} bytes fit", name, written, data.len());
                }
            }
            list(&fs, "/")
        }
        Command::Ls { image, dir } => list(&mount(&image, cli.code_end)?, &dir),
        Command::Cat {
            image,
            file,
            offset,
            whence,
        } => cat(&mut mount(&image, cli.code_end)?, &file, offset, whence),
    }
}
