mod field_types;
mod raknet;
