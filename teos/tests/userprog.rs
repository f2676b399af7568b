//! Process lifecycle scenarios: execute/wait/exit, argument passing,
//! loader validation, deny-write, and the syscall ABI.

#![feature(never_type)]

mod common;

use common::{Capture, ENTRY, Seg, build_elf, build_elf_with, current_name, read_args, upoke};
use teos::arch::{Eflags, IntrFrame};
use teos::fs::memfs::MemFs;
use teos::kernel::{Kernel, KernelBuilder};
use teos::process;
use teos::syscall::{self, SyscallNumber};
use teos::thread::scheduler::SchedPolicy;

/// Boots a kernel over `files` whose user mode is played by `user`.
fn boot_user(
    files: &[(&str, Vec<u8>)],
    capture: Capture,
    user: impl Fn(&'static Kernel, IntrFrame) -> ! + 'static,
) -> &'static Kernel {
    let fs = MemFs::new();
    for (name, image) in files {
        fs.add(name, image);
    }
    KernelBuilder::new()
        .scheduler(SchedPolicy::Prio)
        .filesystem(fs)
        .console(capture)
        .user_entry(user)
        .boot()
}

#[test]
fn echo_prints_its_arguments() {
    let capture = Capture::new();
    let kernel = boot_user(
        &[("echo", common::trivial_elf())],
        capture.clone(),
        |kernel, frame| {
            assert_eq!(current_name(kernel), "echo");
            assert_eq!(frame.eip, ENTRY);
            assert!(Eflags::from_bits_truncate(frame.eflags).contains(Eflags::IF));
            // esp+4 lands on a 16-byte boundary, just past the fake
            // return address.
            assert_eq!((frame.esp as usize + 4) % 16, 0);

            let (argc, args) = read_args(kernel, &frame);
            assert_eq!(argc, 3);
            assert_eq!(args, ["echo", "hello", "world"]);

            // Compose the output on the user stack and write(1) it out.
            let text = format!("{}\n", args[1..].join(" "));
            let scratch = frame.esp as usize - 256;
            upoke(kernel, scratch, text.as_bytes());
            let n = syscall::sys_write(kernel, 1, scratch, text.len()).unwrap();
            assert_eq!(n, text.len());
            process::exit(kernel, 0)
        },
    );

    let pid = process::execute(kernel, "echo hello world").unwrap();
    assert_eq!(process::wait(kernel, pid), 0);
    let out = capture.contents();
    assert!(out.contains("hello world\n"), "console said: {out:?}");
    assert!(out.contains("echo: exit(0)\n"), "console said: {out:?}");
}

#[test]
fn wait_returns_the_exit_code_exactly_once() {
    let capture = Capture::new();
    let kernel = boot_user(
        &[("child", common::trivial_elf())],
        capture.clone(),
        |kernel, _frame| process::exit(kernel, 42),
    );

    let pid = process::execute(kernel, "child").unwrap();
    assert_eq!(process::wait(kernel, pid), 42);
    assert_eq!(process::wait(kernel, pid), -1);
    assert!(capture.contents().contains("child: exit(42)\n"));
}

#[test]
fn wait_in_reverse_spawn_order() {
    let capture = Capture::new();
    let kernel = boot_user(
        &[
            ("seven", common::trivial_elf()),
            ("eight", common::trivial_elf()),
        ],
        capture,
        |kernel, _frame| match current_name(kernel).as_str() {
            "seven" => process::exit(kernel, 7),
            "eight" => process::exit(kernel, 8),
            other => panic!("unexpected program {other}"),
        },
    );

    let seven = process::execute(kernel, "seven").unwrap();
    let eight = process::execute(kernel, "eight").unwrap();
    assert_eq!(process::wait(kernel, eight), 8);
    assert_eq!(process::wait(kernel, seven), 7);
}

#[test]
fn wait_rejects_strangers_and_bogus_pids() {
    let capture = Capture::new();
    let kernel = boot_user(
        &[
            ("child", common::trivial_elf()),
            ("stranger", common::trivial_elf()),
        ],
        capture,
        |kernel, frame| match current_name(kernel).as_str() {
            // The child just lingers long enough to be a wait target.
            "child" => process::exit(kernel, 5),
            "stranger" => {
                let (_, args) = read_args(kernel, &frame);
                let victim: i32 = args[1].parse().unwrap();
                // Not our child: collapsed to -1.
                assert_eq!(process::wait(kernel, victim), -1);
                process::exit(kernel, 0)
            }
            other => panic!("unexpected program {other}"),
        },
    );

    assert_eq!(process::wait(kernel, 9999), -1);

    let child = process::execute(kernel, "child").unwrap();
    let stranger = process::execute(kernel, &format!("stranger {child}")).unwrap();
    assert_eq!(process::wait(kernel, stranger), 0);
    assert_eq!(process::wait(kernel, child), 5);
}

#[test]
fn loader_rejects_malformed_executables() {
    let capture = Capture::new();

    let badmagic = build_elf_with(ENTRY, &[Seg::code(ENTRY, b"\x90")], |image| {
        image[0] = b'M';
    });
    let dynamic = {
        let mut seg = Seg::code(ENTRY, b"\x90");
        seg.ptype = 2; // PT_DYNAMIC
        build_elf(ENTRY, &[Seg::code(ENTRY, b"\x90"), seg])
    };
    let shrunk = build_elf_with(ENTRY, &[Seg::code(ENTRY, b"\x90\x90\x90\x90")], |image| {
        // p_memsz < p_filesz
        image[52 + 20..52 + 24].copy_from_slice(&1u32.to_le_bytes());
    });
    let page0 = build_elf(0x400, &[Seg::code(0x400, b"\x90")]);
    let misaligned = build_elf_with(ENTRY, &[Seg::code(ENTRY, b"\x90")], |image| {
        // Break the offset/vaddr page-congruence rule.
        let off = u32::from_le_bytes(image[56..60].try_into().unwrap());
        image[56..60].copy_from_slice(&(off + 4).to_le_bytes());
    });
    let empty_seg = build_elf(ENTRY, &[Seg::data(ENTRY, b"", 0x1000)]);
    let wraps = build_elf(0xbfff_f000, &[Seg::data(0xbfff_f000, b"x", 0x10000)]);

    let kernel = boot_user(
        &[
            ("badmagic", badmagic),
            ("dynamic", dynamic),
            ("shrunk", shrunk),
            ("page0", page0),
            ("misaligned", misaligned),
            ("empty", empty_seg),
            ("wraps", wraps),
            ("truncated", b"\x7fELF".to_vec()),
        ],
        capture,
        |_kernel, _frame| panic!("nothing here should reach user mode"),
    );

    for prog in [
        "badmagic",
        "dynamic",
        "shrunk",
        "page0",
        "misaligned",
        "empty",
        "wraps",
        "truncated",
        "nosuchfile",
    ] {
        assert!(
            process::execute(kernel, prog).is_err(),
            "{prog} must not load"
        );
    }
}

#[test]
fn failed_load_unwinds_its_pages() {
    let capture = Capture::new();
    let fs = MemFs::new();
    fs.add("victim", &common::trivial_elf());
    // Budget: one kernel stack for the idle thread, one for the child,
    // one page for the lone code segment, and nothing left for the user
    // stack page.
    let stack_pages = teos::thread::STACK_SIZE / 0x1000;
    let kernel = KernelBuilder::new()
        .scheduler(SchedPolicy::Prio)
        .filesystem(fs)
        .console(capture)
        .page_budget(2 * stack_pages + 1)
        .user_entry(|_kernel, _frame| panic!("load must fail before user mode"))
        .boot();

    assert!(process::execute(kernel, "victim").is_err());
    // Everything the attempt acquired came back.
    assert_eq!(kernel.pages_left(), stack_pages + 1);

    // With the budget restored, nothing is permanently broken: a second
    // attempt fails the same way rather than corrupting state.
    assert!(process::execute(kernel, "victim").is_err());
    assert_eq!(kernel.pages_left(), stack_pages + 1);
}

#[test]
fn running_executable_denies_writes() {
    let capture = Capture::new();
    let kernel = boot_user(
        &[("denywrite", common::trivial_elf())],
        capture,
        |kernel, frame| {
            let (_, args) = read_args(kernel, &frame);
            assert_eq!(args[0], "denywrite");

            // argv[0]'s string body doubles as the path argument.
            let esp = frame.esp as usize;
            let argv = common::upeek_u32(kernel, esp + 8) as usize;
            let name_ptr = common::upeek_u32(kernel, argv) as usize;

            let fd = syscall::sys_open(kernel, name_ptr).unwrap() as i32;
            assert!(fd >= 2);
            // Writing our own image fails while we run: zero bytes stick.
            assert_eq!(syscall::sys_write(kernel, fd, name_ptr, 4).unwrap(), 0);
            process::exit(kernel, 0)
        },
    );

    let pid = process::execute(kernel, "denywrite").unwrap();
    assert_eq!(process::wait(kernel, pid), 0);

    // The process is gone; the denial is lifted.
    let file = kernel.open_file("denywrite").unwrap();
    assert_eq!(file.write(b"xyz").unwrap(), 3);
}

#[test]
fn syscall_abi_reads_the_user_stack() {
    let capture = Capture::new();
    let kernel = boot_user(
        &[("abi", common::trivial_elf())],
        capture.clone(),
        |kernel, frame| {
            let esp = frame.esp as usize;

            // get_tid: number only.
            let scratch = esp - 128;
            upoke(kernel, scratch, &(SyscallNumber::GetTid as u32).to_le_bytes());
            let mut f = frame.clone();
            f.esp = scratch as u32;
            syscall::dispatch(kernel, &mut f);
            assert_eq!(f.eax as i32, kernel.current_tid());

            // write(1, buf, len): three arguments above the number.
            let text = b"hi\n";
            let buf = esp - 64;
            upoke(kernel, buf, text);
            let mut words = Vec::new();
            words.extend_from_slice(&(SyscallNumber::Write as u32).to_le_bytes());
            words.extend_from_slice(&1u32.to_le_bytes());
            words.extend_from_slice(&(buf as u32).to_le_bytes());
            words.extend_from_slice(&(text.len() as u32).to_le_bytes());
            upoke(kernel, scratch, &words);
            let mut f = frame.clone();
            f.esp = scratch as u32;
            syscall::dispatch(kernel, &mut f);
            assert_eq!(f.eax, 3);

            // A garbage number is ENOSYS, not a dead process.
            upoke(kernel, scratch, &0xdead_u32.to_le_bytes());
            let mut f = frame.clone();
            f.esp = scratch as u32;
            syscall::dispatch(kernel, &mut f);
            assert!((f.eax as i32) < 0);

            // exit(33) through the full ABI; never returns.
            let mut words = Vec::new();
            words.extend_from_slice(&(SyscallNumber::Exit as u32).to_le_bytes());
            words.extend_from_slice(&33u32.to_le_bytes());
            upoke(kernel, scratch, &words);
            let mut f = frame.clone();
            f.esp = scratch as u32;
            syscall::dispatch(kernel, &mut f);
            unreachable!("exit returned");
        },
    );

    let pid = process::execute(kernel, "abi").unwrap();
    assert_eq!(process::wait(kernel, pid), 33);
    let out = capture.contents();
    assert!(out.contains("hi\n"));
    assert!(out.contains("abi: exit(33)\n"));
}

#[test]
fn console_and_file_descriptors() {
    let capture = Capture::new();
    let mut files = vec![("rw", common::trivial_elf())];
    files.push(("data.txt", b"0123456789".to_vec()));
    let kernel = boot_user(&files, capture, |kernel, frame| {
        let esp = frame.esp as usize;
        let name = esp - 32;
        upoke(kernel, name, b"data.txt\0");

        // Reading the console with nothing pending returns 0 bytes;
        // the reserved descriptors reject the wrong direction.
        let buf = esp - 96;
        assert_eq!(syscall::sys_read(kernel, 0, buf, 8).unwrap(), 0);
        assert!(syscall::sys_write(kernel, 0, buf, 1).is_err());
        assert!(syscall::sys_read(kernel, 1, buf, 1).is_err());

        // Descriptors count up from 2 and are independent.
        let fd1 = syscall::sys_open(kernel, name).unwrap() as i32;
        let fd2 = syscall::sys_open(kernel, name).unwrap() as i32;
        assert_eq!((fd1, fd2), (2, 3));

        assert_eq!(syscall::sys_read(kernel, fd1, buf, 4).unwrap(), 4);
        assert_eq!(common::upeek_u32(kernel, buf).to_le_bytes(), *b"0123");
        // fd2 has its own cursor.
        assert_eq!(syscall::sys_read(kernel, fd2, buf, 2).unwrap(), 2);
        assert_eq!(common::upeek_u32(kernel, buf).to_le_bytes()[..2], *b"01");

        assert_eq!(syscall::sys_close(kernel, fd1).unwrap(), 0);
        assert!(syscall::sys_close(kernel, fd1).is_err());
        assert!(syscall::sys_read(kernel, fd1, buf, 1).is_err());
        let p = teos::process::current_process(kernel).unwrap();
        assert_eq!(p.files.open_count(kernel), 1);
        process::exit(kernel, 0)
    });

    let pid = process::execute(kernel, "rw").unwrap();
    assert_eq!(process::wait(kernel, pid), 0);
}
