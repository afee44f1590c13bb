use crate::{buffer::Buffer, serialization::FieldWriter};

#[test]
fn bool_write_true() {
    let mut buffer = Buffer::new(1024);
    true.write(&mut buffer);
    assert_eq!(buffer.take()[0], 1);
}

#[test]
fn bool_write_false() {
    let mut buffer = Buffer::new(1024);
    false.write(&mut buffer);
    assert_eq!(buffer.take()[0], 0);
}

#[test]
fn u16_write_big_endian() {
    let mut buffer = Buffer::new(1024);
    0x1F90_u16.write(&mut buffer);
    assert_eq!(buffer.take(), &[0x1F, 0x90]);
}

#[test]
fn i64_write_big_endian() {
    let mut buffer = Buffer::new(1024);
    0x0102030405060708_i64.write(&mut buffer);
    assert_eq!(buffer.take(), &[1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn string_write_varint_prefixed() {
    let mut buffer = Buffer::new(1024);
    "net".to_string().write(&mut buffer);
    assert_eq!(buffer.take(), &[0x03, 0x6E, 0x65, 0x74]);
}
