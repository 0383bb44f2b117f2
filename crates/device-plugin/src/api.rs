//! Generated kubelet device plugin API (`v1beta1`).
#![allow(clippy::doc_markdown)]
#![allow(clippy::doc_overindented_list_items)]

tonic::include_proto!("v1beta1");
