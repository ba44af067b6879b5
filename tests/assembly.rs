//! Integration tests assembling complete images.
//!
//! These tests drive the full pipeline the way the surrounding system does: logical
//! models are turned into directory buffers, sections are populated, and the assembler
//! runs the three-phase protocol before serializing to a byte sink.

use peforge::prelude::*;

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// A 32-bit image with imports, a thunk stub jumping through the IAT, and the
/// relocations the stub requires, assembled end to end.
#[test]
fn test_imports_with_trampolines_and_relocations() -> Result<()> {
    let mut symbols = SymbolTable::new();

    let mut kernel32 = ImportedModule::new("KERNEL32.DLL");
    kernel32.add_symbol(ImportedSymbol::by_name(0x130, "ExitProcess"));
    kernel32.add_symbol(ImportedSymbol::by_ordinal(7));

    let mut imports = ImportDirectoryBuffer::new(false);
    imports.add_module(kernel32);
    imports.build(&mut symbols);

    let exit_process_slot = imports.iat_slots("KERNEL32.DLL").unwrap()[0];

    // A .text stub that jumps to ExitProcess through the IAT.
    let platform = for_machine(MachineType::I386);
    let mut trampolines = TrampolineTableBuffer::new(platform);
    let stub_entry = trampolines.add_function_trampoline(&mut symbols, exit_process_slot)?;
    trampolines.finalize(&mut symbols)?;

    let mut relocations = RelocationsDirectoryBuffer::new();
    relocations.add_all(trampolines.relocations().iter().copied());

    let mut text = Section::new(".text", SectionFlags::CNT_CODE | SectionFlags::MEM_EXECUTE);
    text.contents_mut().add(trampolines);

    let mut idata = Section::new(
        ".idata",
        SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ,
    );
    idata.contents_mut().add(imports);

    let mut parameters = ImageParameters::default();
    parameters.machine = MachineType::I386;
    parameters.image_base = 0x40_0000;

    let mut assembler = ImageAssembler::new(parameters)?;
    assembler.add_section(text);
    assembler.add_section(idata);

    let mut sink = Vec::new();
    assembler.assemble(&mut symbols, &mut sink)?;

    // The stub sits at the start of .text and embeds the IAT slot's absolute VA.
    let stub = symbols.resolve(stub_entry)?;
    assert_eq!(stub.rva, 0x1000);
    let code = &sink[stub.offset as usize..stub.offset as usize + 6];
    let target = platform.extract_thunk_address(code, stub.rva, 0x40_0000)?;

    let slot = symbols.resolve(exit_process_slot)?;
    assert_eq!(target, 0x40_0000 + u64::from(slot.rva));

    // The absolute operand needs exactly one HighLow fixup, at the literal's page offset.
    let blocks = relocations.to_blocks(&symbols)?;
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].page_rva, 0x1000);
    assert_eq!(blocks[0].entries.len(), 1);
    assert_eq!(blocks[0].entries[0].offset(), 2);
    assert_eq!(
        blocks[0].entries[0].relocation_type(),
        RelocationType::HighLow
    );

    // The IAT slot itself holds the RVA of the ExitProcess hint-name entry, which lives
    // inside .idata (rva 0x2000) and starts with the hint.
    let slot_value = read_u32(&sink, slot.offset as usize);
    assert!(slot_value >= 0x2000);
    let entry_offset = 0x600 + (slot_value - 0x2000) as usize;
    assert_eq!(&sink[entry_offset..entry_offset + 2], &0x130u16.to_le_bytes());
    assert_eq!(&sink[entry_offset + 2..entry_offset + 13], b"ExitProcess");
    Ok(())
}

/// Resources and metadata tables flow through the same section machinery.
#[test]
fn test_resources_and_tables_in_one_image() -> Result<()> {
    let mut symbols = SymbolTable::new();

    // A two-level resource tree: type 16 (version) -> one data entry.
    let mut version = ResourceDirectory::new();
    version.add_data(ResourceId::Id(1), ResourceData::new(vec![0x5A; 10]));
    let mut root = ResourceDirectory::new();
    root.add_directory(ResourceId::Id(16), version);
    let resources = ResourceDirectoryBuffer::new(root);

    // A deduplicated metadata table flushed to its physical form.
    let mut module_refs = DistinctTableBuffer::new(TableId::ModuleRef);
    let first = module_refs.add(Row::new(vec![0x10]));
    assert_eq!(module_refs.add(Row::new(vec![0x10])), first);
    let table = module_refs
        .flush(ColumnLayout::new(vec![2])?)
        .expect("row widths match the layout");

    let mut rsrc = Section::new(".rsrc", SectionFlags::CNT_INITIALIZED_DATA);
    rsrc.contents_mut().add(resources);

    let mut meta = Section::new(".meta", SectionFlags::CNT_INITIALIZED_DATA);
    meta.contents_mut().add(table);

    let mut assembler = ImageAssembler::new(ImageParameters::default())?;
    assembler.add_section(rsrc);
    assembler.add_section(meta);

    let mut sink = Vec::new();
    assembler.assemble(&mut symbols, &mut sink)?;

    // .rsrc is the first section: file 0x400, rva 0x1000. Root directory entry points
    // at the subdirectory; the subdirectory's entry points at the data entry, whose
    // first field is the absolute content RVA.
    let rsrc_base = 0x400;
    let subdir = read_u32(&sink, rsrc_base + 20);
    assert_eq!(subdir, 24 | 0x8000_0000);
    let data_entry = read_u32(&sink, rsrc_base + 24 + 20);
    assert_eq!(data_entry & 0x8000_0000, 0);
    let content_rva = read_u32(&sink, rsrc_base + data_entry as usize);
    assert_eq!(content_rva, 0x1000 + 64);
    assert_eq!(read_u32(&sink, rsrc_base + data_entry as usize + 4), 10);

    // The flushed table landed in .meta with one 2-byte row.
    let meta_section = assembler.sections()[1].address().unwrap();
    assert_eq!(meta_section.offset, 0x600);
    assert_eq!(&sink[0x600..0x602], &[0x10, 0x00]);
    Ok(())
}

/// Every declared cross-segment reference must resolve, or assembly fails before the
/// sink sees a single byte.
#[test]
fn test_reference_resolution_is_complete() {
    let mut symbols = SymbolTable::new();

    // A relocation whose target segment is never added to any section.
    let dangling = symbols.reserve();
    let mut relocations = RelocationsDirectoryBuffer::new();
    relocations.add(BaseRelocation::new(RelocationType::HighLow, dangling));

    let mut section = Section::new(".data", SectionFlags::CNT_INITIALIZED_DATA);
    section.contents_mut().add(DataSegment::new(vec![0; 16]));

    let mut assembler = ImageAssembler::new(ImageParameters::default()).unwrap();
    assembler.add_section(section);

    let mut sink = Vec::new();
    assembler.assemble(&mut symbols, &mut sink).unwrap();

    // The image itself assembled; finalizing the relocation directory against the same
    // symbol table surfaces the dangling reference.
    assert!(matches!(
        relocations.finalize(&symbols),
        Err(Error::Consistency { .. })
    ));
}

/// A 64-bit image exercising the PE32+ thunk slot width.
#[test]
fn test_pe32_plus_import_slots() -> Result<()> {
    let mut symbols = SymbolTable::new();

    let mut module = ImportedModule::new("USER32.DLL");
    module.add_symbol(ImportedSymbol::by_ordinal(42));

    let mut imports = ImportDirectoryBuffer::new(true);
    imports.add_module(module);
    imports.build(&mut symbols);

    let mut section = Section::new(".idata", SectionFlags::CNT_INITIALIZED_DATA);
    section.contents_mut().add(imports);

    let mut assembler = ImageAssembler::new(ImageParameters::default())?;
    assembler.add_section(section);

    let mut sink = Vec::new();
    assembler.assemble(&mut symbols, &mut sink)?;

    // Headers: one entry + terminator = 40 bytes; the 8-byte lookup slot follows with
    // bit 63 set for the ordinal import.
    let lookup_rva = read_u32(&sink, 0x400);
    let lookup_offset = 0x400 + (lookup_rva - 0x1000) as usize;
    let slot = u64::from_le_bytes(sink[lookup_offset..lookup_offset + 8].try_into().unwrap());
    assert_eq!(slot, 0x8000_0000_0000_0000 | 42);
    Ok(())
}
