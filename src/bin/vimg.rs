use anyhow::{bail, Result};

mod commands;

fn usage() -> &'static str {
    "Usage:\n  \
     vimg build <package_dir> <output> [--format <name>] [--kernel <version>] [--kernel-dir <dir>] [--arg <kernel_arg>]...\n  \
     vimg formats\n  \
     vimg gpt <image>\n  \
     vimg fs <image>\n  \
     vimg ls <image> [path] [-a]\n  \
     vimg stat <image> <path>\n  \
     vimg cat <image> <path>\n  \
     vimg tree <image> [path]\n  \
     vimg du <image> [path] [--apparent]\n  \
     vimg md5 <image> <path>\n  \
     vimg cp <image> <path> <dest>\n  \
     vimg kernel-files <image>\n  \
     vimg decompile <image> <dest> [--touched-only]"
}

fn main() -> Result<()> {
    vimg::logging::init_subscriber();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, rest @ ..] if cmd == "build" => commands::build::run(rest),
        [cmd] if cmd == "formats" => commands::inspect::formats(),
        [cmd, image] if cmd == "gpt" => commands::inspect::gpt(image),
        [cmd, image] if cmd == "fs" => commands::inspect::fs(image),
        [cmd, image] if cmd == "ls" => commands::inspect::ls(image, "/", false),
        [cmd, image, flag] if cmd == "ls" && flag == "-a" => commands::inspect::ls(image, "/", true),
        [cmd, image, path] if cmd == "ls" => commands::inspect::ls(image, path, false),
        [cmd, image, path, flag] if cmd == "ls" && flag == "-a" => {
            commands::inspect::ls(image, path, true)
        }
        [cmd, image, path] if cmd == "stat" => commands::inspect::stat(image, path),
        [cmd, image, path] if cmd == "cat" => commands::inspect::cat(image, path),
        [cmd, image] if cmd == "tree" => commands::inspect::tree(image, "/"),
        [cmd, image, path] if cmd == "tree" => commands::inspect::tree(image, path),
        [cmd, image] if cmd == "du" => commands::inspect::du(image, "/", false),
        [cmd, image, flag] if cmd == "du" && flag == "--apparent" => {
            commands::inspect::du(image, "/", true)
        }
        [cmd, image, path] if cmd == "du" => commands::inspect::du(image, path, false),
        [cmd, image, path, flag] if cmd == "du" && flag == "--apparent" => {
            commands::inspect::du(image, path, true)
        }
        [cmd, image, path] if cmd == "md5" => commands::inspect::md5(image, path),
        [cmd, image, path, dest] if cmd == "cp" => commands::inspect::cp(image, path, dest),
        [cmd, image] if cmd == "kernel-files" => commands::inspect::kernel_files(image),
        [cmd, image, dest] if cmd == "decompile" => commands::inspect::decompile(image, dest, false),
        [cmd, image, dest, flag] if cmd == "decompile" && flag == "--touched-only" => {
            commands::inspect::decompile(image, dest, true)
        }
        _ => bail!(usage()),
    }
}
