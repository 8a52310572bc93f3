use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};

use crate::context::ObjectContext;
use crate::emit::{dump_signature, padding, Emitter, Formatter, FormatterFlags, FORMATTERS};
use crate::flow::{self, StepSkip};
use crate::gsic;
use crate::hash::{hash32, HashIndex};
use crate::opcode::OpcodeRegistry;
use crate::reader::{
    self, calltype_name, read_export, reader_for, ExportEntry, ExportFlags, ScriptReader,
    CALLTYPE_MASK, CLASS_VTABLE, DEV_CALL, GET_CALL, IMPORT32_ENTRY_SIZE, IMPORT64_ENTRY_SIZE,
};
use crate::rosetta::RosettaSink;
use crate::vm::{self, Platform, VmFlags, MAGIC_IW, MAGIC_MASK, MAGIC_TREYARCH, MIN_FILE_SIZE};
use crate::vtable::VtableReader;
use crate::walker::{AsmWalker, SkipWalker, WalkOutcome};

/// Options consumed by the engine, mapped from the CLI surface.
pub struct Options {
    pub vm: Option<u8>,
    pub platform: Platform,
    pub formatter: &'static Formatter,
    pub skip: StepSkip,
    pub output_dir: Option<PathBuf>,
    pub copyright: Option<String>,
    pub header: bool,
    /// Emit `gscasm` disassembly blocks.
    pub dasm: bool,
    /// Emit reconstructed source.
    pub dcomp: bool,
    pub includes: bool,
    pub imports: bool,
    pub strings: bool,
    pub gvars: bool,
    pub func_header: bool,
    /// Annotate decompiled statements with their relative locations.
    pub func_rloc: bool,
    pub test_header: bool,
    pub patch: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            vm: None,
            platform: Platform::Pc,
            formatter: &FORMATTERS[0],
            skip: StepSkip::empty(),
            output_dir: None,
            copyright: None,
            header: false,
            dasm: false,
            dcomp: true,
            includes: true,
            imports: false,
            strings: false,
            gvars: false,
            func_header: true,
            func_rloc: false,
            test_header: false,
            patch: true,
        }
    }
}

/// State shared across all files of one run.
pub struct RunState {
    pub hash: HashIndex,
    pub registry: OpcodeRegistry,
    pub rosetta: RosettaSink,
    pub dumped_strings: BTreeSet<String>,
}

struct ExportResult {
    entry: ExportEntry,
    remapped_flags: u8,
    outcome: WalkOutcome,
    skip_size: u32,
    duplicate: bool,
}

/// Process one in-memory script blob; returns the rendered output text.
pub fn process_data(
    mut data: Vec<u8>,
    path: &str,
    opts: &Options,
    state: &mut RunState,
) -> Result<String> {
    let gsic_info = if gsic::is_gsic(&data) {
        debug!("reading GSIC wrapper for {}", path);
        let info = gsic::parse(&data)?;
        data.drain(..info.header_size);
        info
    } else {
        Default::default()
    };

    if data.len() < MIN_FILE_SIZE {
        bail!("bad header, file size {:#x}/{:#x}", data.len(), MIN_FILE_SIZE);
    }

    let magic = u64::from_le_bytes(data[..8].try_into().unwrap());
    let vm_byte = if magic & MAGIC_MASK == MAGIC_IW {
        match opts.vm {
            Some(vm) => vm,
            None => bail!("VM type needed with IW GSC file, use --vm to set it"),
        }
    } else if magic & MAGIC_MASK == MAGIC_TREYARCH {
        data[7]
    } else {
        bail!("bad magic 0x{:x}", magic);
    };

    let vm_info = vm::vm_info(vm_byte).ok_or_else(|| anyhow!("bad vm 0x{:x} for file {}", vm_byte, path))?;
    let size = data.len();
    let mut reader =
        reader_for(vm_byte, data).ok_or_else(|| anyhow!("no reader available for vm 0x{:x}", vm_byte))?;
    if !reader.validate(size) {
        bail!("bad header for vm 0x{:x} in {}", vm_byte, path);
    }

    let mut ctx = ObjectContext::new(vm_info);
    ctx.gsic = gsic_info;

    state
        .rosetta
        .start_file(reader.name(), &reader.blob()[..reader.header_size()]);

    let mut out = String::new();
    if let Some(copyright) = &opts.copyright {
        let _ = writeln!(out, "// {}", copyright);
    }

    if opts.header {
        dump_file_header(&mut out, reader.as_ref(), &ctx, path, size, opts, &state.hash);
    }

    // the string section reads raw bytes, so it runs before patching
    if opts.strings {
        dump_strings_section(&mut out, reader.as_ref());
    }

    if opts.patch {
        reader.patch_code(&mut ctx, &state.hash, &mut state.dumped_strings)?;
    }

    if opts.includes && reader.includes_offset() != 0 {
        let blob = reader.blob();
        let mut loc = reader.includes_offset() as usize;
        for _ in 0..reader.includes_count() {
            let hash = crate::bytes::read_u64(blob, loc)?;
            let _ = writeln!(out, "#using {};", state.hash.extract_script(hash));
            loc += 8;
        }
        if reader.includes_count() != 0 {
            out.push('\n');
        }
    }

    for tree in &ctx.animtrees {
        let _ = writeln!(out, "#using animtree(\"{}\");", tree);
    }
    if !ctx.animtrees.is_empty() {
        out.push('\n');
    }

    reader.dump_experimental(&mut out, opts.test_header);

    if opts.gvars {
        dump_gvars_section(&mut out, reader.as_ref(), &state.hash)?;
    }
    if opts.imports {
        dump_imports_section(&mut out, reader.as_ref(), &state.hash)?;
    }

    let exports = walk_exports(reader.as_ref(), &ctx, opts, state)?;
    for export in &exports {
        state.rosetta.add_opcodes(&export.outcome.opcodes);
    }

    if opts.dasm {
        dump_asm_exports(&mut out, &exports, opts, state);
    }
    if opts.dcomp {
        dump_decompiled(&mut out, reader.as_ref(), &exports, &mut ctx, opts, state)?;
    }

    Ok(out)
}

/// Process a script file from disk and write the output next to it or under
/// the output directory.
pub fn process_file(path: &Path, opts: &Options, state: &mut RunState) -> Result<PathBuf> {
    debug!("reading {}", path.display());
    let data = fs::read(path).with_context(|| format!("can't read file data for {}", path.display()))?;
    let pathname = path.display().to_string();

    // compute the output name from the script's own name hash
    let out_path = output_path(&data, path, opts, state)?;
    let text = process_data(data, &pathname, opts, state)?;

    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("can't create output directory {}", parent.display()))?;
        }
    }
    fs::write(&out_path, text)
        .with_context(|| format!("can't open output file {}", out_path.display()))?;
    info!("decompiled into '{}'", out_path.display());
    Ok(out_path)
}

fn output_path(data: &[u8], path: &Path, opts: &Options, state: &RunState) -> Result<PathBuf> {
    let Some(dir) = &opts.output_dir else {
        let mut name = path.as_os_str().to_os_string();
        name.push("asm");
        return Ok(PathBuf::from(name));
    };
    // peel a GSIC wrapper just enough to reach the name field
    let body = if gsic::is_gsic(data) {
        let info = gsic::parse(data)?;
        &data[info.header_size..]
    } else {
        data
    };
    if body.len() < MIN_FILE_SIZE {
        bail!("bad header, file size {:#x}/{:#x}", body.len(), MIN_FILE_SIZE);
    }
    let magic = u64::from_le_bytes(body[..8].try_into().unwrap());
    let name_off = if magic & MAGIC_MASK == MAGIC_IW { 0x08 } else { 0x10 };
    let name = crate::bytes::read_u64(body, name_off)?;
    if state.hash.is_known(name) {
        Ok(dir.join(state.hash.extract("script", name)))
    } else {
        Ok(dir.join(format!("hashed/script/script_{:x}.gsc", name)))
    }
}

fn dump_file_header(
    out: &mut String,
    reader: &dyn ScriptReader,
    ctx: &ObjectContext,
    path: &str,
    size: usize,
    opts: &Options,
    hash: &HashIndex,
) {
    let _ = writeln!(
        out,
        "// {} ({}) (size: {} Bytes / 0x{:x})",
        hash.extract_script(reader.name()),
        path,
        size,
        size
    );
    if ctx.gsic.is_gsic {
        let _ = writeln!(
            out,
            "// GSIC compiled script, header: 0x{:x}",
            ctx.gsic.header_size
        );
        let _ = writeln!(out, "// detours: {}", ctx.gsic.detours.len());
        for detour in ctx.gsic.detours.values() {
            let _ = writeln!(
                out,
                "// - {}<{}>::{} offset: 0x{:x}, size: 0x{:x}",
                hash.extract("namespace", detour.replace_namespace as u64),
                hash.extract_script(detour.replace_script),
                hash.extract("function", detour.replace_function as u64),
                detour.fixup_offset,
                detour.fixup_size
            );
        }
    }
    let magic = crate::bytes::read_u64(reader.blob(), 0).unwrap_or(0);
    let _ = write!(out, "// magic .... 0x{:x} vm: ", magic);
    if reader.vm().has(VmFlags::NO_VERSION) {
        let _ = writeln!(out, "{}", reader.vm().name);
    } else {
        let _ = writeln!(out, "{:x} ({})", reader.vm().vm, reader.vm().name);
    }
    reader.dump_header(out, opts.test_header);
}

fn dump_strings_section(out: &mut String, reader: &dyn ScriptReader) {
    let entries = match reader.string_entries() {
        Ok(entries) => entries,
        Err(err) => {
            let _ = writeln!(out, "// bad string table: {:#}", err);
            return;
        }
    };
    for entry in &entries {
        let _ = writeln!(
            out,
            "String addr:{:x}, count:{}, type:{:x}",
            entry.address,
            entry.fixups.len(),
            entry.kind
        );
        match reader.decrypt_string(entry.address) {
            Ok(text) => {
                let _ = writeln!(out, "-> \"{}\"", text);
            }
            Err(_) => {
                let _ = writeln!(out, "bad string location");
                continue;
            }
        }
        let locs: Vec<String> = entry.fixups.iter().map(|f| format!("{:x}", f)).collect();
        let _ = writeln!(out, "location(s): {}", locs.join(","));
    }
    if !entries.is_empty() {
        out.push('\n');
    }
}

fn dump_gvars_section(out: &mut String, reader: &dyn ScriptReader, hash: &HashIndex) -> Result<()> {
    let blob = reader.blob();
    let mut loc = reader.globals_offset() as usize;
    for _ in 0..reader.globals_count() {
        let name = crate::bytes::read_u32(blob, loc)? as u64;
        let count = crate::bytes::read_u16(blob, loc + 4)? as usize;
        let _ = writeln!(out, "Global var {} {}", hash.extract("var", name), count);
        let mut locs = Vec::with_capacity(count);
        for j in 0..count {
            locs.push(format!(
                "{:x}",
                crate::bytes::read_u32(blob, loc + reader::GLOBAL_ENTRY_SIZE + j * 4)?
            ));
        }
        let _ = writeln!(out, "location(s): {}", locs.join(","));
        loc += reader::GLOBAL_ENTRY_SIZE + count * 4;
    }
    if reader.globals_count() != 0 {
        out.push('\n');
    }
    Ok(())
}

fn dump_imports_section(out: &mut String, reader: &dyn ScriptReader, hash: &HashIndex) -> Result<()> {
    let hash64 = reader.vm().has(VmFlags::HASH64);
    let blob = reader.blob();
    let mut loc = reader.imports_offset() as usize;
    for _ in 0..reader.imports_count() {
        let (name, namespace, count, param_count, flags, entry_size);
        if hash64 {
            name = crate::bytes::read_u64(blob, loc)?;
            namespace = crate::bytes::read_u64(blob, loc + 8)?;
            param_count = crate::bytes::read_u8(blob, loc + 16)?;
            count = crate::bytes::read_u8(blob, loc + 17)? as usize;
            flags = crate::bytes::read_u16(blob, loc + 18)? as u8;
            entry_size = IMPORT64_ENTRY_SIZE;
        } else {
            name = crate::bytes::read_u32(blob, loc)? as u64;
            namespace = crate::bytes::read_u32(blob, loc + 4)? as u64;
            count = crate::bytes::read_u16(blob, loc + 8)? as usize;
            param_count = crate::bytes::read_u8(blob, loc + 10)?;
            flags = crate::bytes::read_u8(blob, loc + 11)?;
            entry_size = IMPORT32_ENTRY_SIZE;
        }
        let remapped = reader.remap_flags_import(flags);
        let _ = write!(out, "import {} ", calltype_name(remapped & CALLTYPE_MASK));
        if remapped & DEV_CALL != 0 {
            out.push_str("devcall ");
        }
        if remapped & GET_CALL == 0 {
            let _ = write!(out, "{}::", hash.extract("namespace", namespace));
        }
        let _ = writeln!(out, "{}", hash.extract("function", name));
        let _ = writeln!(
            out,
            "address: {}, params: {}, iflags: 0x{:x}, loc: 0x{:x}",
            count, param_count, flags, loc
        );
        let mut locs = Vec::with_capacity(count);
        for j in 0..count {
            locs.push(format!(
                "{:x}",
                crate::bytes::read_u32(blob, loc + entry_size + j * 4)?
            ));
        }
        let _ = writeln!(out, "location(s): {}", locs.join(","));
        let _ = writeln!(out, "--------------");
        loc += entry_size + count * 4;
    }
    if reader.imports_count() != 0 {
        out.push('\n');
    }
    Ok(())
}

fn walk_exports(
    reader: &dyn ScriptReader,
    ctx: &ObjectContext,
    opts: &Options,
    state: &RunState,
) -> Result<Vec<ExportResult>> {
    let hash64 = reader.vm().has(VmFlags::HASH64);
    let entry_size = reader::export_entry_size(hash64);
    let blob = reader.blob();
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    let mut results = Vec::with_capacity(reader.exports_count() as usize);

    for i in 0..reader.exports_count() {
        let off = reader.exports_offset() as usize + i as usize * entry_size;
        let entry = read_export(blob, off, hash64)?;
        if entry.address as usize >= blob.len() {
            warn!(
                "export {} at 0x{:x} outside the blob, skipped",
                state.hash.extract("function", entry.name),
                entry.address
            );
            continue;
        }
        let duplicate = !seen.insert((entry.namespace, entry.name));
        let outcome = AsmWalker::new(
            blob,
            entry.address as usize,
            reader.vm(),
            opts.platform,
            &state.registry,
            ctx,
            &state.hash,
        )
        .walk();
        let skip_size = SkipWalker::new(
            blob,
            entry.address as usize,
            reader.vm(),
            opts.platform,
            &state.registry,
        )
        .compute_size();
        results.push(ExportResult {
            remapped_flags: reader.remap_flags_export(entry.flags),
            entry,
            outcome,
            skip_size,
            duplicate,
        });
    }
    Ok(results)
}

fn export_decorations(remapped: u8) -> String {
    let flags = ExportFlags::from_bits_truncate(remapped);
    let mut out = String::new();
    if flags.contains(ExportFlags::PRIVATE) {
        out.push_str("private ");
    }
    if flags.contains(ExportFlags::AUTOEXEC) {
        out.push_str("autoexec ");
    }
    out
}

fn dump_function_header(
    out: &mut String,
    export: &ExportResult,
    ctx: &ObjectContext,
    opts: &Options,
    hash: &HashIndex,
    depth: usize,
) {
    if !opts.func_header {
        return;
    }
    let one_line = opts
        .formatter
        .flags
        .contains(FormatterFlags::ONE_LINE_HEADER_COMMENTS);
    let prefix = if one_line { "" } else { "// " };
    let mut depth = depth;
    if one_line {
        padding(out, depth);
        out.push_str("/*\n");
        depth += 1;
    }
    let entry = &export.entry;
    let flags = ExportFlags::from_bits_truncate(export.remapped_flags);
    let class_member = flags.intersects(ExportFlags::CLASS_MEMBER | ExportFlags::CLASS_DESTRUCTOR);
    let ns_kind = if class_member { "class" } else { "namespace" };

    padding(out, depth);
    let sep = if ctx.vm.has(VmFlags::FULL_FILE_NAMESPACE) { " / " } else { "/" };
    let file_ns_kind = if flags.contains(ExportFlags::EVENT) { "event" } else { "namespace" };
    let _ = writeln!(
        out,
        "{}Namespace {}{}{}",
        prefix,
        hash.extract(ns_kind, entry.namespace),
        sep,
        hash.extract(file_ns_kind, entry.file_namespace)
    );
    if let Some(detour) = ctx.gsic.detours.get(&entry.address) {
        padding(out, depth);
        let _ = writeln!(
            out,
            "{}Detour {} offset 0x{:x}/0x{:x}",
            prefix,
            hash.extract("function", entry.name),
            detour.fixup_offset,
            detour.fixup_size
        );
    }
    padding(out, depth);
    let _ = write!(
        out,
        "{}Params {}, eflags: 0x{:x}",
        prefix, entry.param_count, entry.flags
    );
    if export.remapped_flags == CLASS_VTABLE {
        out.push_str(" vtable");
    } else {
        if flags.contains(ExportFlags::LINKED) {
            out.push_str(" linked");
        }
        if flags.contains(ExportFlags::CLASS_LINKED) {
            out.push_str(" class_linked");
        }
    }
    out.push('\n');
    padding(out, depth);
    let _ = writeln!(
        out,
        "{}Checksum 0x{:x}, Offset: 0x{:x}",
        prefix, entry.checksum, entry.address
    );
    if export.skip_size > 2 {
        padding(out, depth);
        let _ = writeln!(out, "{}Size: 0x{:x}", prefix, export.skip_size);
    }
    if one_line {
        depth -= 1;
        padding(out, depth);
        out.push_str("*/\n");
    }
}

fn dump_asm_exports(out: &mut String, exports: &[ExportResult], opts: &Options, state: &RunState) {
    let mut current_ns = 0u64;
    for export in exports {
        if export.entry.namespace != current_ns {
            current_ns = export.entry.namespace;
            let _ = writeln!(
                out,
                "#namespace {};\n",
                state.hash.extract("namespace", current_ns)
            );
        }
        if export.duplicate {
            let _ = writeln!(
                out,
                "// duplicate export {}::{}\n",
                state.hash.extract("namespace", export.entry.namespace),
                state.hash.extract("function", export.entry.name)
            );
            continue;
        }
        let _ = writeln!(
            out,
            "// {}::{}",
            state.hash.extract("namespace", export.entry.namespace),
            state.hash.extract("function", export.entry.name)
        );
        open_asm_block(out, opts);
        out.push_str(&export.outcome.asm);
        out.push_str("}\n\n");
    }
}

fn open_asm_block(out: &mut String, opts: &Options) {
    if opts
        .formatter
        .flags
        .contains(FormatterFlags::NEWLINE_AFTER_BLOCK_START)
    {
        out.push_str("gscasm\n{\n");
    } else {
        out.push_str("gscasm {\n");
    }
}

fn dump_decompiled(
    out: &mut String,
    reader: &dyn ScriptReader,
    exports: &[ExportResult],
    ctx: &mut ObjectContext,
    opts: &Options,
    state: &RunState,
) -> Result<()> {
    let constructor = hash32("__constructor") as u64;
    let destructor = hash32("__destructor") as u64;

    // vtable exports register the classes before anything is printed; a
    // pattern mismatch demotes the export to disassembly only
    let mut vtable_texts: Vec<(usize, Option<String>)> = Vec::new();
    for (i, export) in exports.iter().enumerate() {
        if export.remapped_flags != CLASS_VTABLE || export.duplicate {
            continue;
        }
        let mut text = String::new();
        let vt = VtableReader::new(
            reader.blob(),
            export.entry.address as usize,
            reader.vm(),
            opts.platform,
            &state.registry,
        );
        match vt.read(&export.entry, ctx, &state.hash, &mut text, 1) {
            Ok(_) => vtable_texts.push((i, Some(text))),
            Err(err) => {
                warn!(
                    "vtable pattern mismatch in {}: {:#}",
                    state.hash.extract("class", export.entry.name),
                    err
                );
                vtable_texts.push((i, None));
            }
        }
    }

    // run the reconstruction passes on every ordinary export
    let mut structured: Vec<Option<ExportBody>> = Vec::new();
    for export in exports {
        if export.remapped_flags == CLASS_VTABLE || export.duplicate {
            structured.push(None);
            continue;
        }
        structured.push(Some(build_body(export, opts)));
    }

    let mut emitted: HashSet<usize> = HashSet::new();
    let mut current_ns = 0u64;

    // class blocks first
    let class_names: Vec<u64> = ctx.classes.keys().copied().collect();
    for class_name in class_names {
        let cls = ctx.classes[&class_name].clone();
        if cls.name_space != current_ns {
            current_ns = cls.name_space;
            let _ = writeln!(
                out,
                "#namespace {};\n",
                state.hash.extract("namespace", current_ns)
            );
        }
        let _ = writeln!(out, "// Namespace {}", state.hash.extract("namespace", cls.name_space));
        let _ = writeln!(out, "// Method(s) {} Total {}", cls.methods.len(), cls.vtable.len());
        let _ = write!(out, "class {}", state.hash.extract("class", class_name));
        if !cls.super_classes.is_empty() {
            out.push_str(" : ");
            for (i, sup) in cls.super_classes.iter().enumerate() {
                if i != 0 {
                    out.push_str(", ");
                }
                out.push_str(&state.hash.extract("class", *sup));
            }
        }
        if opts
            .formatter
            .flags
            .contains(FormatterFlags::NEWLINE_AFTER_BLOCK_START)
        {
            out.push_str("\n{\n\n");
        } else {
            out.push_str(" {\n\n");
        }

        // member variables assigned through self in any method body
        if !opts.skip.contains(StepSkip::CLASSMEMBER_INLINE) {
            let mut members = BTreeSet::new();
            for (i, export) in exports.iter().enumerate() {
                if export.entry.namespace != class_name {
                    continue;
                }
                if let Some(Some(body)) = structured.get(i) {
                    flow::collect_self_members(&body.ast, &body.block.statements, &mut members);
                }
            }
            if !members.is_empty() {
                let mut names: Vec<String> =
                    members.iter().map(|m| state.hash.extract("var", *m)).collect();
                names.sort();
                for name in names {
                    padding(out, 1);
                    let _ = writeln!(out, "var {};", name);
                }
                out.push('\n');
            }
        }

        // constructor and destructor lead, then the method list
        let mut order: Vec<u64> = Vec::new();
        order.push(constructor);
        order.push(destructor);
        order.extend(cls.methods.iter().copied());
        for method in order {
            let Some(i) = exports.iter().position(|e| {
                e.entry.namespace == class_name && e.entry.name == method && !e.duplicate
            }) else {
                continue;
            };
            if emitted.contains(&i) {
                continue;
            }
            let export = &exports[i];
            let Some(body) = &structured[i] else { continue };
            let is_special = method == constructor || method == destructor;
            let force_name = if method == constructor {
                Some("constructor")
            } else if method == destructor {
                Some("destructor")
            } else {
                None
            };
            if is_special
                && crate::ast::count_real_statements(&body.ast, &body.block.statements) == 0
            {
                // empty generated constructor/destructor
                emitted.insert(i);
                continue;
            }
            emit_function(out, export, body, ctx, opts, state, 1, force_name);
            emitted.insert(i);
        }
        out.push_str("}\n\n");
    }

    // remaining exports, table order, with vtable listings inline
    for (i, export) in exports.iter().enumerate() {
        if export.duplicate || emitted.contains(&i) {
            continue;
        }
        if export.entry.namespace != current_ns {
            current_ns = export.entry.namespace;
            let _ = writeln!(
                out,
                "#namespace {};\n",
                state.hash.extract("namespace", current_ns)
            );
        }
        if export.remapped_flags == CLASS_VTABLE {
            if let Some((_, text)) = vtable_texts.iter().find(|(j, _)| *j == i) {
                dump_function_header(out, export, ctx, opts, &state.hash, 0);
                match text {
                    Some(text) => {
                        let _ = write!(out, "vtable {}", state.hash.extract("class", export.entry.name));
                        if opts
                            .formatter
                            .flags
                            .contains(FormatterFlags::NEWLINE_AFTER_BLOCK_START)
                        {
                            out.push_str("\n{\n");
                        } else {
                            out.push_str(" {\n");
                        }
                        out.push_str(text);
                        out.push_str("}\n\n");
                    }
                    None => {
                        let _ = writeln!(
                            out,
                            "// bad vtable pattern for {}",
                            state.hash.extract("class", export.entry.name)
                        );
                        open_asm_block(out, opts);
                        out.push_str(&export.outcome.asm);
                        out.push_str("}\n\n");
                    }
                }
            }
            continue;
        }
        let Some(body) = &structured[i] else { continue };
        emit_function(out, export, body, ctx, opts, state, 0, None);
    }
    Ok(())
}

struct ExportBody {
    ast: crate::ast::Ast,
    block: crate::ast::FunctionBlock,
    localvars: Vec<crate::walker::LocalVar>,
    decompilable: bool,
}

fn build_body(export: &ExportResult, opts: &Options) -> ExportBody {
    let mut ast = export.outcome.ast.clone();
    let mut block = export.outcome.block.clone();
    let mut localvars = export.outcome.localvars.clone();
    let mut decompilable = export.outcome.decompilable;
    if decompilable {
        flow::compute_default_params(&mut ast, &mut block, &mut localvars);
        flow::reconstruct(&mut ast, &mut block, opts.skip);
        if flow::has_unstructured(&ast, &block.statements) {
            decompilable = false;
        }
    }
    ExportBody {
        ast,
        block,
        localvars,
        decompilable,
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_function(
    out: &mut String,
    export: &ExportResult,
    body: &ExportBody,
    ctx: &ObjectContext,
    opts: &Options,
    state: &RunState,
    depth: usize,
    force_name: Option<&str>,
) {
    dump_function_header(out, export, ctx, opts, &state.hash, depth);
    let mut emitter = Emitter::new(&body.ast, &state.hash, opts.formatter);
    emitter.show_rloc = opts.func_rloc;
    let flags = ExportFlags::from_bits_truncate(export.remapped_flags);

    let mut decorations = export_decorations(export.remapped_flags);
    if flags.contains(ExportFlags::EVENT) {
        decorations.push_str(&format!(
            "event_handler[{}] ",
            state.hash.extract("event", export.entry.file_namespace)
        ));
    }
    let mut name = match force_name {
        Some(name) => name.to_string(),
        None => state.hash.extract("function", export.entry.name),
    };
    if flags.contains(ExportFlags::CLASS_DESTRUCTOR) && force_name.is_none() {
        name = format!("~{}", name);
    }
    if let Some(detour) = ctx.gsic.detours.get(&export.entry.address) {
        let mut target = String::from("detour ");
        if detour.replace_namespace != 0 {
            target.push_str(&state.hash.extract("namespace", detour.replace_namespace as u64));
        }
        if detour.replace_script != 0 {
            target.push_str(&format!("<{}>", state.hash.extract_script(detour.replace_script)));
        }
        if detour.replace_namespace != 0 {
            target.push_str("::");
        }
        target.push_str(&state.hash.extract("function", detour.replace_function as u64));
        name = target;
    }

    padding(out, depth);
    let keyword = if force_name.is_some() { None } else { Some("function") };
    let mut signature = String::new();
    dump_signature(
        &mut signature,
        &emitter,
        keyword,
        &decorations,
        &name,
        &body.localvars,
        export.entry.param_count,
    );
    out.push_str(&signature);

    if !body.decompilable {
        out.push('\n');
        padding(out, depth);
        open_asm_block(out, opts);
        out.push_str(&export.outcome.asm);
        padding(out, depth);
        out.push_str("}\n");
        padding(out, depth);
        let _ = writeln!(
            out,
            "// can't decompile export {}::{}\n",
            state.hash.extract("namespace", export.entry.namespace),
            state.hash.extract("function", export.entry.name)
        );
        return;
    }

    emitter.dump_block(out, &body.block.statements, depth);
    out.push('\n');
}
